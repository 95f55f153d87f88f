// src/main.rs

//! The binary entry point: loads configuration, initializes logging, and
//! builds the core (`Store`, `EventBus`, `Dispatcher`). Transport/framing
//! of client connections is an out-of-scope collaborator (spec §1); this
//! binary exists to prove the core wires together the way `spineldb::main`
//! wires up its own `Config`/logging/server triple, not to serve traffic.

use anyhow::Result;
use std::env;
use tracing::info;
use vlobd::config::Config;
use vlobd::core::dispatcher::Dispatcher;
use vlobd::core::events::EventBus;
use vlobd::core::maintenance::NullMessageSender;
use vlobd::core::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("vlobd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(_) => {
            info!(config_path, "no config file found, using defaults");
            Config::default()
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .compact()
        .init();

    info!(
        host = %config.host,
        port = config.port,
        ballpark_timestamp_tolerance_secs = config.ballpark_timestamp_tolerance_secs,
        peer_event_max_wait_secs = config.peer_event_max_wait_secs,
        max_reencryption_batch = config.max_reencryption_batch,
        max_blob_size_bytes = config.max_blob_size_bytes,
        "starting vlobd core"
    );

    let _store = Store::new();
    let _event_bus = EventBus::new();
    let _dispatcher = Dispatcher::new();
    let _message_sender = NullMessageSender;

    info!("core ready; no transport is wired in this binary (spec §1 out-of-scope collaborator)");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
