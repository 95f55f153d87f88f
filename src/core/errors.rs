// src/core/errors.rs

//! Defines the primary error type for the core, crossing every component
//! boundary as a single tagged enum (see the REDESIGN FLAG on error
//! taxonomy: no exception-driven control flow reaches the dispatcher).

use thiserror::Error;

/// The flat error enum shared by the policy, realm, vlob, and maintenance
/// components. The dispatcher is the sole place that maps these to wire
/// status strings (`to_status`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Realm `{0}` doesn't exist")]
    RealmNotFound(String),

    #[error("Vlob `{0}` doesn't exist")]
    VlobNotFound(String),

    #[error("Vlob `{0}` already exists")]
    VlobAlreadyExists(String),

    #[error("not allowed")]
    NotAllowed,

    #[error("bad version")]
    BadVersion,

    #[error("bad encryption revision")]
    BadEncryptionRevision,

    #[error("realm `{0}` is in maintenance")]
    InMaintenance(String),

    #[error("{0}")]
    MaintenanceError(String),

    #[error("timestamp out of the ballpark")]
    BadTimestamp,

    #[error("{0}")]
    AlreadyGranted(String),

    #[error("certificate timestamp must be strictly greater than the previous one")]
    RequireGreaterTimestamp,

    #[error("{0}")]
    InvalidCertification(String),

    #[error("role grant is incompatible with the realm's current state")]
    IncompatibleProfile,

    #[error("cancelled by a new command on the same connection")]
    CancelledByNewCommand,

    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Maps a `CoreError` to the wire status string the dispatcher attaches
    /// to a reply (spec §6/§7). Internal errors are never leaked to the
    /// wire; callers should log them and translate to `unknown_error`
    /// instead of calling this for `Internal`, but the mapping is provided
    /// for completeness of the taxonomy.
    pub fn to_status(&self) -> &'static str {
        match self {
            CoreError::RealmNotFound(_) | CoreError::VlobNotFound(_) => "not_found",
            CoreError::VlobAlreadyExists(_) => "already_exists",
            CoreError::NotAllowed => "not_allowed",
            CoreError::BadVersion => "bad_version",
            CoreError::BadEncryptionRevision => "bad_encryption_revision",
            CoreError::InMaintenance(_) => "in_maintenance",
            CoreError::MaintenanceError(_) => "maintenance_error",
            CoreError::BadTimestamp => "bad_timestamp",
            CoreError::AlreadyGranted(_) => "already_granted",
            CoreError::RequireGreaterTimestamp => "require_greater_timestamp",
            CoreError::InvalidCertification(_) => "invalid_certification",
            CoreError::IncompatibleProfile => "incompatible_profile",
            CoreError::CancelledByNewCommand => "cancelled_by_new_cmd",
            CoreError::BadMessage(_) => "bad_message",
            CoreError::UnknownCommand(_) => "unknown_command",
            CoreError::Internal(_) => "unknown_error",
        }
    }
}
