// src/config.rs

//! Manages server configuration: loading from TOML and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// Resolved server configuration (spec §6 "Configuration variables").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `BALLPARK_TIMESTAMP_TOLERANCE`: maximum allowed clock skew, in
    /// seconds, between a client-supplied write timestamp and server time.
    #[serde(default = "default_ballpark_timestamp_tolerance_secs")]
    pub ballpark_timestamp_tolerance_secs: i64,

    /// `PEER_EVENT_MAX_WAIT`: the bound on how long `events_listen` may
    /// suspend before returning with no event.
    #[serde(default = "default_peer_event_max_wait_secs")]
    pub peer_event_max_wait_secs: u64,

    /// `MAX_REENCRYPTION_BATCH`: the largest batch size a client may
    /// request from `vlob_maintenance_get_reencryption_batch`.
    #[serde(default = "default_max_reencryption_batch")]
    pub max_reencryption_batch: usize,

    /// `MAX_BLOB_SIZE`: the largest ciphertext payload accepted for a
    /// single vlob version.
    #[serde(default = "default_max_blob_size_bytes")]
    pub max_blob_size_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6776
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ballpark_timestamp_tolerance_secs() -> i64 {
    300
}
fn default_peer_event_max_wait_secs() -> u64 {
    300
}
fn default_max_reencryption_batch() -> usize {
    1000
}
fn default_max_blob_size_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            ballpark_timestamp_tolerance_secs: default_ballpark_timestamp_tolerance_secs(),
            peer_event_max_wait_secs: default_peer_event_max_wait_secs(),
            max_reencryption_batch: default_max_reencryption_batch(),
            max_blob_size_bytes: default_max_blob_size_bytes(),
        }
    }
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.ballpark_timestamp_tolerance_secs <= 0 {
            return Err(anyhow!("ballpark_timestamp_tolerance_secs must be positive"));
        }
        if self.max_reencryption_batch == 0 {
            return Err(anyhow!("max_reencryption_batch cannot be 0"));
        }
        if self.max_blob_size_bytes == 0 {
            return Err(anyhow!("max_blob_size_bytes cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 7000\n").unwrap();
        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, default_host());
    }

    #[test]
    fn rejects_zero_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 0\n").unwrap();
        assert!(Config::from_file(path.to_str().unwrap()).is_err());
    }
}
