// src/core/dispatcher/mod.rs

//! The command dispatcher (spec §4.5): decodes a wire frame into a typed
//! request, looks up the command in a static table built once at startup
//! (an explicit re-architecture of the decorator-based `@api(...)`
//! registration in `original_source/parsec/backend/utils.py`, per the
//! REDESIGN FLAG in spec §9), runs it against the `Store`, and encodes
//! whatever `CoreError` comes back into a wire status.

pub mod request;
pub mod wire;

use crate::core::dispatcher::request::{ok_reply, timestamp_field, ClientContext, RequestReader};
use crate::core::dispatcher::wire::Value;
use crate::core::errors::CoreError;
use crate::core::events::{Event, EventBus};
use crate::core::maintenance::MessageSender;
use crate::core::store::Store;
use std::collections::HashSet;
use tracing::info_span;
use tracing::Instrument;

/// Every command name the dispatcher will accept. Built once; looking up
/// a name not in this set short-circuits to `unknown_command` before any
/// parsing is attempted.
const COMMAND_NAMES: &[&str] = &[
    "vlob_create",
    "vlob_read",
    "vlob_update",
    "vlob_poll_changes",
    "vlob_maintenance_get_reencryption_batch",
    "vlob_maintenance_save_reencryption_batch",
    "realm_status",
    "realm_get_role_certificates",
    "realm_update_roles",
    "realm_start_reencryption_maintenance",
    "realm_finish_reencryption_maintenance",
    "events_listen",
];

/// The static command table. Holds nothing but the set of known names —
/// each command's parse/execute logic lives in `dispatch`'s match arms,
/// but membership in `known` is what separates `unknown_command` from a
/// genuine per-command parse failure.
pub struct Dispatcher {
    known: HashSet<&'static str>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            known: COMMAND_NAMES.iter().copied().collect(),
        }
    }

    /// Runs one command end to end: decode is assumed to have already
    /// happened (the transport layer hands us `cmd` plus a decoded
    /// `Value::Map`); this dispatches, invokes the `Store`, and always
    /// returns a reply value — errors never propagate past this call.
    pub async fn dispatch(
        &self,
        store: &Store,
        event_bus: &EventBus,
        message_sender: &dyn MessageSender,
        ctx: &ClientContext,
        ballpark_tolerance_secs: i64,
        cmd: &str,
        request: &Value,
    ) -> Value {
        if !self.known.contains(cmd) {
            return request::err_reply(&CoreError::UnknownCommand(cmd.to_string()));
        }

        let span = info_span!(
            "command",
            cmd,
            organization_id = %ctx.organization_id,
            device = %ctx.device,
        );

        async {
            let fields = match request.as_map() {
                Ok(map) => map,
                Err(err) => return request::err_reply(&err),
            };
            let reader = RequestReader(fields);

            let result = self
                .run(store, event_bus, message_sender, ctx, ballpark_tolerance_secs, cmd, &reader)
                .await;

            match result {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::debug!(status = err.to_status(), "command failed");
                    request::err_reply(&err)
                }
            }
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        store: &Store,
        event_bus: &EventBus,
        message_sender: &dyn MessageSender,
        ctx: &ClientContext,
        ballpark_tolerance_secs: i64,
        cmd: &str,
        r: &RequestReader<'_>,
    ) -> Result<Value, CoreError> {
        let now = chrono::Utc::now();

        match cmd {
            "vlob_create" => {
                store
                    .vlob_create(
                        &ctx.organization_id,
                        &ctx.device,
                        event_bus,
                        r.realm_id("realm_id")?,
                        r.vlob_id("vlob_id")?,
                        r.timestamp("timestamp")?,
                        now,
                        ballpark_tolerance_secs,
                        r.bin("blob")?,
                        r.optional_encryption_revision("encryption_revision")?,
                    )
                    .await?;
                Ok(ok_reply(vec![]))
            }

            "vlob_read" => {
                let result = store
                    .vlob_read(
                        &ctx.organization_id,
                        &ctx.device,
                        r.vlob_id("vlob_id")?,
                        r.optional_version("version")?,
                        r.optional_encryption_revision("encryption_revision")?,
                    )
                    .await?;
                Ok(ok_reply(vec![
                    ("version", Value::UInt(result.version.0)),
                    ("blob", Value::Bin(result.blob)),
                    ("author", Value::Str(result.author.0)),
                    ("timestamp", timestamp_field(result.timestamp)),
                ]))
            }

            "vlob_update" => {
                store
                    .vlob_update(
                        &ctx.organization_id,
                        &ctx.device,
                        event_bus,
                        r.vlob_id("vlob_id")?,
                        r.version("version")?,
                        r.timestamp("timestamp")?,
                        now,
                        ballpark_tolerance_secs,
                        r.bin("blob")?,
                        r.optional_encryption_revision("encryption_revision")?,
                    )
                    .await?;
                Ok(ok_reply(vec![]))
            }

            "vlob_poll_changes" => {
                let result = store
                    .vlob_poll_changes(
                        &ctx.organization_id,
                        &ctx.device,
                        r.realm_id("realm_id")?,
                        r.uint("last_checkpoint")?,
                    )
                    .await?;
                let mut changes = Value::map();
                for (vlob_id, version) in result.changes {
                    changes.insert(vlob_id.to_string(), Value::UInt(version.0));
                }
                Ok(ok_reply(vec![
                    ("current_checkpoint", Value::UInt(result.current_checkpoint)),
                    ("changes", Value::Map(changes)),
                ]))
            }

            "vlob_maintenance_get_reencryption_batch" => {
                let batch = store
                    .vlob_maintenance_get_reencryption_batch(
                        &ctx.organization_id,
                        &ctx.device,
                        r.realm_id("realm_id")?,
                        r.encryption_revision("encryption_revision")?,
                        r.uint("size")? as usize,
                    )
                    .await?;
                let entries = batch
                    .into_iter()
                    .map(|entry| {
                        let mut map = Value::map();
                        map.insert("vlob_id".to_string(), Value::Str(entry.vlob_id.to_string()));
                        map.insert("version".to_string(), Value::UInt(entry.version.0));
                        map.insert("data".to_string(), Value::Bin(entry.data));
                        Value::Map(map)
                    })
                    .collect();
                Ok(ok_reply(vec![("batch", Value::Array(entries))]))
            }

            "vlob_maintenance_save_reencryption_batch" => {
                let batch = match r.0.get("batch") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(parse_batch_entry)
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(CoreError::BadMessage("field `batch` must be an array".to_string())),
                };
                let result = store
                    .vlob_maintenance_save_reencryption_batch(
                        &ctx.organization_id,
                        &ctx.device,
                        r.realm_id("realm_id")?,
                        r.encryption_revision("encryption_revision")?,
                        batch,
                    )
                    .await?;
                Ok(ok_reply(vec![
                    ("total", Value::UInt(result.total as u64)),
                    ("done", Value::UInt(result.done as u64)),
                ]))
            }

            "realm_status" => {
                let status = store
                    .get_status(&ctx.organization_id, &ctx.user_id(), r.realm_id("realm_id")?)
                    .await?;
                Ok(ok_reply(vec![
                    ("in_maintenance", Value::Bool(status.in_maintenance)),
                    (
                        "maintenance_type",
                        status
                            .maintenance_type
                            .map(|t| Value::Str(t.to_string()))
                            .unwrap_or(Value::Null),
                    ),
                    (
                        "maintenance_started_by",
                        status
                            .started_by
                            .map(|d| Value::Str(d.0))
                            .unwrap_or(Value::Null),
                    ),
                    (
                        "maintenance_started_on",
                        status.started_on.map(timestamp_field).unwrap_or(Value::Null),
                    ),
                    (
                        "encryption_revision",
                        Value::UInt(status.encryption_revision.0),
                    ),
                ]))
            }

            "realm_get_role_certificates" => {
                let certificates = store
                    .get_role_certificates(
                        &ctx.organization_id,
                        &ctx.user_id(),
                        r.realm_id("realm_id")?,
                        r.optional_uint("since")?
                            .and_then(|m| chrono::DateTime::from_timestamp_micros(m as i64)),
                    )
                    .await?;
                let encoded = certificates
                    .into_iter()
                    .map(|cert| {
                        let mut map = Value::map();
                        map.insert("granted_by".to_string(), Value::Str(cert.granted_by.0));
                        map.insert("granted_to".to_string(), Value::Str(cert.granted_to.0));
                        map.insert(
                            "role".to_string(),
                            cert.role.map(|role| Value::Str(role.to_string())).unwrap_or(Value::Null),
                        );
                        map.insert("granted_on".to_string(), timestamp_field(cert.granted_on));
                        map.insert("signature".to_string(), Value::Bin(cert.signature));
                        Value::Map(map)
                    })
                    .collect();
                Ok(ok_reply(vec![("certificates", Value::Array(encoded))]))
            }

            "realm_update_roles" => {
                let target_user = crate::core::ids::UserID(r.str("user_id")?);
                let role = match r.0.get("role") {
                    None | Some(Value::Null) => None,
                    Some(Value::Str(s)) => Some(
                        s.parse()
                            .map_err(|_| CoreError::InvalidCertification(format!("unknown role `{s}`")))?,
                    ),
                    Some(_) => return Err(CoreError::BadMessage("field `role` must be a string".to_string())),
                };
                let recipient_message = r.optional_bin("recipient_message")?;
                store
                    .update_roles(
                        &ctx.organization_id,
                        &ctx.device,
                        event_bus,
                        r.realm_id("realm_id")?,
                        target_user.clone(),
                        role,
                        r.timestamp("timestamp")?,
                    )
                    .await?;
                // `recipient_message` (spec §6): the new key material for the
                // granted user, handed opaquely to the message subsystem the
                // same way `start_reencryption`'s `per_participant_message` is.
                if let Some(payload) = recipient_message {
                    message_sender
                        .deliver(&ctx.organization_id, &target_user, &payload)
                        .await;
                }
                Ok(ok_reply(vec![]))
            }

            "realm_start_reencryption_maintenance" => {
                let messages = r.user_message_map("per_participant_message")?;
                store
                    .start_reencryption(
                        &ctx.organization_id,
                        &ctx.device,
                        event_bus,
                        message_sender,
                        r.realm_id("realm_id")?,
                        r.encryption_revision("encryption_revision")?,
                        messages,
                        r.timestamp("timestamp")?,
                    )
                    .await?;
                Ok(ok_reply(vec![]))
            }

            "realm_finish_reencryption_maintenance" => {
                store
                    .finish_reencryption(
                        &ctx.organization_id,
                        &ctx.device,
                        event_bus,
                        r.realm_id("realm_id")?,
                        r.encryption_revision("encryption_revision")?,
                    )
                    .await?;
                Ok(ok_reply(vec![]))
            }

            "events_listen" => Err(CoreError::Internal(
                "events_listen must be driven through Dispatcher::events_listen, not run()".to_string(),
            )),

            _ => unreachable!("checked against `known` above"),
        }
    }

    /// `events_listen` (spec §5, supplemented in SPEC_FULL §4.5): races the
    /// realm's event stream against a cancellation signal the connection
    /// layer fires when it observes a new inbound frame on the same
    /// session — `tokio::select!` standing in for the source's nursery
    /// scope (spec §9 REDESIGN FLAG).
    pub async fn events_listen(
        &self,
        event_bus: &EventBus,
        ctx: &ClientContext,
        realm_id: crate::core::ids::RealmID,
        wait: bool,
        peer_event_max_wait_secs: u64,
        cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Value {
        let mut receiver = event_bus.subscribe(&ctx.organization_id, realm_id);

        if !wait {
            return match receiver.try_recv() {
                Ok(event) => event_reply(event),
                Err(_) => ok_reply(vec![("status", Value::Str("no_events".to_string()))]),
            };
        }

        let timeout = tokio::time::sleep(std::time::Duration::from_secs(peer_event_max_wait_secs));
        tokio::pin!(timeout);
        tokio::pin!(cancel);

        tokio::select! {
            biased;
            _ = &mut cancel => request::err_reply(&CoreError::CancelledByNewCommand),
            event = receiver.recv() => match event {
                Ok(event) => event_reply(event),
                Err(_lagged_or_closed) => ok_reply(vec![("status", Value::Str("no_events".to_string()))]),
            },
            _ = &mut timeout => ok_reply(vec![("status", Value::Str("no_events".to_string()))]),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn event_reply(event: Event) -> Value {
    match event {
        Event::RealmVlobsUpdated {
            realm_id,
            checkpoint,
            src_id,
            src_version,
            author,
        } => ok_reply(vec![
            ("event", Value::Str("realm.vlobs_updated".to_string())),
            ("realm_id", Value::Str(realm_id.to_string())),
            ("checkpoint", Value::UInt(checkpoint)),
            ("src_id", Value::Str(src_id.to_string())),
            ("src_version", Value::UInt(src_version.0)),
            ("author", Value::Str(author.0)),
        ]),
        Event::RealmRolesUpdated { realm_id, user } => ok_reply(vec![
            ("event", Value::Str("realm.roles_updated".to_string())),
            ("realm_id", Value::Str(realm_id.to_string())),
            ("user", Value::Str(user.0)),
        ]),
        Event::RealmMaintenanceStarted {
            realm_id,
            encryption_revision,
        } => ok_reply(vec![
            ("event", Value::Str("realm.maintenance_started".to_string())),
            ("realm_id", Value::Str(realm_id.to_string())),
            ("encryption_revision", Value::UInt(encryption_revision.0)),
        ]),
        Event::RealmMaintenanceFinished {
            realm_id,
            encryption_revision,
        } => ok_reply(vec![
            ("event", Value::Str("realm.maintenance_finished".to_string())),
            ("realm_id", Value::Str(realm_id.to_string())),
            ("encryption_revision", Value::UInt(encryption_revision.0)),
        ]),
    }
}

fn parse_batch_entry(value: &Value) -> Result<crate::core::vlob::BatchEntry, CoreError> {
    let map = value.as_map()?;
    let reader = RequestReader(map);
    Ok(crate::core::vlob::BatchEntry {
        vlob_id: reader.vlob_id("vlob_id")?,
        version: reader.version("version")?,
        data: reader.bin("data")?,
    })
}
