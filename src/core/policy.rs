// src/core/policy.rs

//! The access-rights policy: a pure function from `(role, operation, realm
//! status)` to a decision. Stateless beyond the snapshot it is given (spec
//! §4.1); it never looks up anything itself, which keeps it trivially
//! testable without a store.

use crate::core::ids::RealmRole;
use crate::core::realm::RealmStatus;

/// The three operation kinds the policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    DataRead,
    DataWrite,
    Maintenance,
}

/// The outcome of a policy check. `NotFound` is deliberately absent here:
/// the policy never sees a realm that doesn't exist, that distinction is
/// made by the caller (realm/vlob store) one level up, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    NotAllowed,
    InMaintenance,
}

/// A read is additionally allowed during maintenance only for a migrated
/// version's revision (one strictly below the realm's in-progress target);
/// the policy itself only gates role + command kind against maintenance
/// mode in general — the revision-specific carve-out is applied by the
/// vlob component, which alone knows which revision is being read.
pub fn check(role: Option<RealmRole>, op: OperationKind, status: &RealmStatus) -> PolicyDecision {
    let Some(role) = role else {
        return PolicyDecision::NotAllowed;
    };

    let in_maintenance = status.is_in_maintenance();

    match op {
        OperationKind::DataRead => PolicyDecision::Allow,
        OperationKind::DataWrite => {
            if !role.can_write() {
                PolicyDecision::NotAllowed
            } else if in_maintenance {
                PolicyDecision::InMaintenance
            } else {
                PolicyDecision::Allow
            }
        }
        OperationKind::Maintenance => {
            if role != RealmRole::Owner {
                PolicyDecision::NotAllowed
            } else {
                PolicyDecision::Allow
            }
        }
    }
}
