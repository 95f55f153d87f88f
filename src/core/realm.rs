// src/core/realm.rs

//! The Realm/Role component (spec §4.3): source of truth for realm
//! existence, role grants, and maintenance status. Operations here only
//! ever touch one realm's `RealmEntry`, taken from the `Store`.

use crate::core::errors::CoreError;
use crate::core::events::{Event, EventBus};
use crate::core::ids::{
    DeviceID, EncryptionRevision, MaintenanceType, OrganizationID, RealmID, RealmRole, Timestamp,
    UserID,
};
use crate::core::policy::{self, OperationKind, PolicyDecision};
use crate::core::store::Store;

/// A signed, timestamped record granting or revoking a role. `signature`
/// is carried opaquely: the core verifies only monotonic timestamps and
/// that `granted_by` currently holds OWNER (spec §3) — it never performs
/// cryptographic verification itself (spec §1 Non-goals).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCertificate {
    pub granted_by: DeviceID,
    pub granted_to: UserID,
    pub role: Option<RealmRole>,
    pub granted_on: Timestamp,
    pub signature: Vec<u8>,
}

/// `status = NORMAL(rev) | MAINTENANCE{type, started_by, started_on, rev}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealmStatus {
    Normal {
        encryption_revision: EncryptionRevision,
    },
    Maintenance {
        maintenance_type: MaintenanceType,
        started_by: DeviceID,
        started_on: Timestamp,
        encryption_revision: EncryptionRevision,
    },
}

impl RealmStatus {
    pub fn is_in_maintenance(&self) -> bool {
        matches!(self, RealmStatus::Maintenance { .. })
    }

    pub fn encryption_revision(&self) -> EncryptionRevision {
        match self {
            RealmStatus::Normal {
                encryption_revision,
            } => *encryption_revision,
            RealmStatus::Maintenance {
                encryption_revision,
                ..
            } => *encryption_revision,
        }
    }
}

/// A read-only snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmStatusView {
    pub in_maintenance: bool,
    pub maintenance_type: Option<MaintenanceType>,
    pub started_by: Option<DeviceID>,
    pub started_on: Option<Timestamp>,
    pub encryption_revision: EncryptionRevision,
}

impl Store {
    /// `get_role_certificates`: requires the caller to currently hold any
    /// non-`None` role. Returns certificates with `granted_on > since` in
    /// log order.
    pub async fn get_role_certificates(
        &self,
        organization_id: &OrganizationID,
        caller: &UserID,
        realm_id: RealmID,
        since: Option<Timestamp>,
    ) -> Result<Vec<RoleCertificate>, CoreError> {
        let org = self.org(organization_id);
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let entry = entry.read().await;

        if entry.effective_role(caller).is_none() {
            return Err(CoreError::NotAllowed);
        }

        Ok(entry
            .roles_log
            .iter()
            .filter(|cert| since.is_none_or(|since| cert.granted_on > since))
            .cloned()
            .collect())
    }

    /// `get_status` (spec §4.3).
    pub async fn get_status(
        &self,
        organization_id: &OrganizationID,
        caller: &UserID,
        realm_id: RealmID,
    ) -> Result<RealmStatusView, CoreError> {
        let org = self.org(organization_id);
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let entry = entry.read().await;

        if entry.effective_role(caller).is_none() {
            return Err(CoreError::NotAllowed);
        }

        Ok(match &entry.status {
            RealmStatus::Normal {
                encryption_revision,
            } => RealmStatusView {
                in_maintenance: false,
                maintenance_type: None,
                started_by: None,
                started_on: None,
                encryption_revision: *encryption_revision,
            },
            RealmStatus::Maintenance {
                maintenance_type,
                started_by,
                started_on,
                encryption_revision,
            } => RealmStatusView {
                in_maintenance: true,
                maintenance_type: Some(*maintenance_type),
                started_by: Some(started_by.clone()),
                started_on: Some(*started_on),
                encryption_revision: *encryption_revision,
            },
        })
    }

    /// `update_roles` (spec §4.3). Only OWNER may grant; MANAGER may not
    /// grant OWNER or MANAGER. `timestamp` must be strictly greater than
    /// the latest certificate's timestamp in this realm's log.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_roles(
        &self,
        organization_id: &OrganizationID,
        author_device: &DeviceID,
        event_bus: &EventBus,
        realm_id: RealmID,
        target_user: UserID,
        role: Option<RealmRole>,
        timestamp: Timestamp,
    ) -> Result<(), CoreError> {
        let org = self.org(organization_id);
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let mut entry = entry.write().await;

        let author_role = entry.effective_role(&author_device.user_id());
        match (author_role, role) {
            (None, _) => return Err(CoreError::NotAllowed),
            (Some(author_role), Some(granted_role)) if !author_role.can_manage(granted_role) => {
                return Err(CoreError::NotAllowed);
            }
            (Some(author_role), None) => {
                // Revocation: the author must be able to manage the role
                // the target currently holds.
                if let Some(current) = entry.effective_role(&target_user)
                    && !author_role.can_manage(current)
                {
                    return Err(CoreError::NotAllowed);
                }
            }
            _ => {}
        }

        if entry.status.is_in_maintenance() {
            return Err(CoreError::InMaintenance(realm_id.to_string()));
        }

        if let Some(last) = entry.roles_log.last()
            && timestamp <= last.granted_on
        {
            return Err(CoreError::RequireGreaterTimestamp);
        }

        let current = entry.effective_role(&target_user);
        if current == role {
            // Idempotent no-op re-grant/re-revoke is reported as ok by the
            // caller semantics for revocation, but a duplicate *grant* of
            // the exact same role is rejected (spec §6 `already_granted`).
            if role.is_some() {
                return Err(CoreError::AlreadyGranted(format!(
                    "user `{target_user}` already has role {role:?}"
                )));
            }
        }

        entry.roles_log.push(RoleCertificate {
            granted_by: author_device.clone(),
            granted_to: target_user.clone(),
            role,
            granted_on: timestamp,
            signature: Vec::new(),
        });

        event_bus.publish(
            organization_id,
            realm_id,
            Event::RealmRolesUpdated {
                realm_id,
                user: target_user,
            },
        );

        Ok(())
    }

    /// Internal helper shared by the vlob and maintenance components: runs
    /// the access-rights policy against a realm snapshot already under
    /// lock, translating the resulting decision into a `CoreError`.
    pub(crate) fn enforce(
        role: Option<RealmRole>,
        op: OperationKind,
        status: &RealmStatus,
        realm_id: RealmID,
    ) -> Result<(), CoreError> {
        match policy::check(role, op, status) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::NotAllowed => Err(CoreError::NotAllowed),
            PolicyDecision::InMaintenance => Err(CoreError::InMaintenance(realm_id.to_string())),
        }
    }
}
