// src/core/ids.rs

//! Identifiers and small value types shared across every component.
//!
//! These are treated as opaque by the core: organization/user/device
//! identity is owned by a collaborator subsystem (see spec §1) and only
//! consumed here through these newtypes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// A top-level organization shard. Organizations are disjoint: nothing in
/// this crate ever compares or iterates across two different `OrganizationID`s.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrganizationID(pub String);

impl fmt::Display for OrganizationID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user within an organization. Opaque beyond equality and display.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserID(pub String);

impl fmt::Display for UserID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single device belonging to a user, conventionally `"<user>@<device>"`.
/// The core never parses this format beyond extracting the owning user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceID(pub String);

impl DeviceID {
    /// Extracts the owning `UserID` from a `"<user>@<device>"` identifier.
    pub fn user_id(&self) -> UserID {
        match self.0.split_once('@') {
            Some((user, _device)) => UserID(user.to_string()),
            None => UserID(self.0.clone()),
        }
    }
}

impl fmt::Display for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A realm: a shared group of encrypted data with its own ACL and epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RealmID(pub Uuid);

impl fmt::Display for RealmID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A versioned blob identifier, unique within its organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VlobID(pub Uuid);

impl fmt::Display for VlobID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UTC, microsecond-precision instant. All timestamps in certificates,
/// vlob versions, and maintenance state use this type.
pub type Timestamp = DateTime<Utc>;

/// A monotone counter naming the realm's current encryption key, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncryptionRevision(pub u64);

impl EncryptionRevision {
    pub const FIRST: EncryptionRevision = EncryptionRevision(1);

    pub fn next(self) -> EncryptionRevision {
        EncryptionRevision(self.0 + 1)
    }
}

impl fmt::Display for EncryptionRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 1-indexed, monotone vlob version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub const FIRST: Version = Version(1);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A realm-scoped role. Ordered weakest to strongest so that comparisons
/// like `role >= RealmRole::Contributor` read naturally.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RealmRole {
    Reader,
    Contributor,
    Manager,
    Owner,
}

impl RealmRole {
    /// Whether this role may perform `DATA_WRITE` operations.
    pub fn can_write(self) -> bool {
        self >= RealmRole::Contributor
    }

    /// Whether this role may grant/revoke roles held by `target`.
    /// Only `OWNER` may grant or revoke `OWNER`/`MANAGER`; `MANAGER` may
    /// grant/revoke `CONTRIBUTOR`/`READER` only.
    pub fn can_manage(self, target: RealmRole) -> bool {
        match self {
            RealmRole::Owner => true,
            RealmRole::Manager => target < RealmRole::Manager,
            _ => false,
        }
    }
}

/// The kind of maintenance a realm can undergo. Currently only reencryption.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MaintenanceType {
    Reencryption,
}
