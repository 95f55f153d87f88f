// src/core/dispatcher/request.rs

//! Typed accessors over a decoded request `Value::Map`, and the reply
//! builders every command handler funnels through. Mirrors the narrow
//! "pull typed fields out of an untyped payload, reject on mismatch"
//! step `spineldb`'s `ParseCommand` impls perform before a command runs.

use crate::core::dispatcher::wire::Value;
use crate::core::errors::CoreError;
use crate::core::ids::{DeviceID, EncryptionRevision, OrganizationID, RealmID, UserID, Version, VlobID};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

/// The authenticated caller a command runs as, established by the
/// (out-of-scope, spec §1) transport/identity layer before the payload
/// ever reaches the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub organization_id: OrganizationID,
    pub device: DeviceID,
}

impl ClientContext {
    pub fn user_id(&self) -> UserID {
        self.device.user_id()
    }
}

/// A thin wrapper giving typed, field-missing-aware access to a request map.
pub struct RequestReader<'a>(pub &'a IndexMap<String, Value>);

impl<'a> RequestReader<'a> {
    fn field(&self, name: &str) -> Result<&'a Value, CoreError> {
        self.0
            .get(name)
            .ok_or_else(|| CoreError::BadMessage(format!("missing field `{name}`")))
    }

    pub fn str(&self, name: &str) -> Result<String, CoreError> {
        match self.field(name)? {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(CoreError::BadMessage(format!("field `{name}` must be a string"))),
        }
    }

    pub fn bin(&self, name: &str) -> Result<Vec<u8>, CoreError> {
        match self.field(name)? {
            Value::Bin(b) => Ok(b.clone()),
            _ => Err(CoreError::BadMessage(format!("field `{name}` must be bytes"))),
        }
    }

    pub fn optional_bin(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bin(b)) => Ok(Some(b.clone())),
            Some(_) => Err(CoreError::BadMessage(format!("field `{name}` must be bytes"))),
        }
    }

    pub fn uint(&self, name: &str) -> Result<u64, CoreError> {
        match self.field(name)? {
            Value::UInt(n) => Ok(*n),
            _ => Err(CoreError::BadMessage(format!("field `{name}` must be an integer"))),
        }
    }

    pub fn optional_uint(&self, name: &str) -> Result<Option<u64>, CoreError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::UInt(n)) => Ok(Some(*n)),
            Some(_) => Err(CoreError::BadMessage(format!("field `{name}` must be an integer"))),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, CoreError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(CoreError::BadMessage(format!("field `{name}` must be a boolean"))),
        }
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid, CoreError> {
        let raw = self.str(name)?;
        Uuid::parse_str(&raw).map_err(|_| CoreError::BadMessage(format!("field `{name}` must be a uuid")))
    }

    pub fn realm_id(&self, name: &str) -> Result<RealmID, CoreError> {
        Ok(RealmID(self.uuid(name)?))
    }

    pub fn vlob_id(&self, name: &str) -> Result<VlobID, CoreError> {
        Ok(VlobID(self.uuid(name)?))
    }

    pub fn timestamp(&self, name: &str) -> Result<DateTime<Utc>, CoreError> {
        let micros = self.uint(name)? as i64;
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| CoreError::BadMessage(format!("field `{name}` is not a valid timestamp")))
    }

    pub fn encryption_revision(&self, name: &str) -> Result<EncryptionRevision, CoreError> {
        Ok(EncryptionRevision(self.uint(name)?))
    }

    pub fn optional_encryption_revision(&self, name: &str) -> Result<Option<EncryptionRevision>, CoreError> {
        Ok(self.optional_uint(name)?.map(EncryptionRevision))
    }

    pub fn version(&self, name: &str) -> Result<Version, CoreError> {
        Ok(Version(self.uint(name)?))
    }

    pub fn optional_version(&self, name: &str) -> Result<Option<Version>, CoreError> {
        Ok(self.optional_uint(name)?.map(Version))
    }

    /// `per_participant_message`/`per_user_msgs`: a map of `user -> bytes`.
    pub fn user_message_map(&self, name: &str) -> Result<std::collections::HashMap<UserID, Vec<u8>>, CoreError> {
        match self.field(name)? {
            Value::Map(entries) => entries
                .iter()
                .map(|(user, value)| match value {
                    Value::Bin(b) => Ok((UserID(user.clone()), b.clone())),
                    _ => Err(CoreError::BadMessage(format!("field `{name}` values must be bytes"))),
                })
                .collect(),
            _ => Err(CoreError::BadMessage(format!("field `{name}` must be a map"))),
        }
    }
}

pub fn timestamp_field(ts: DateTime<Utc>) -> Value {
    Value::UInt(ts.timestamp_micros() as u64)
}

/// Builds a successful reply: `{status: "ok", ...fields}`.
pub fn ok_reply(fields: Vec<(&str, Value)>) -> Value {
    let mut map = Value::map();
    map.insert("status".to_string(), Value::Str("ok".to_string()));
    for (key, value) in fields {
        map.insert(key.to_string(), value);
    }
    Value::Map(map)
}

/// Builds an error reply: `{status: <code>, reason: <message>}`.
pub fn err_reply(error: &CoreError) -> Value {
    let mut map = Value::map();
    map.insert("status".to_string(), Value::Str(error.to_status().to_string()));
    map.insert("reason".to_string(), Value::Str(error.to_string()));
    Value::Map(map)
}
