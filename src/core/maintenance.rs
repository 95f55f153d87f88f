// src/core/maintenance.rs

//! The maintenance controller (spec §4.3, §4.5): moves a realm through
//! `NORMAL(rev) -> MAINTENANCE{REENCRYPTION, rev+1} -> NORMAL(rev+1)`,
//! coordinating the realm's status with the vlob staging area under the
//! realm's single lock.

use crate::core::errors::CoreError;
use crate::core::events::{Event, EventBus};
use crate::core::ids::{DeviceID, EncryptionRevision, MaintenanceType, OrganizationID, RealmID, RealmRole, Timestamp, UserID, Version};
use crate::core::realm::RealmStatus;
use crate::core::store::{ReencryptionState, Store};
use std::collections::{HashMap, HashSet};

/// The message subsystem collaborator (spec §1: "out of scope... the core
/// produces a per-recipient opaque byte string and hands it to the
/// message subsystem"). Implemented by whatever delivers messages to
/// users; the core only needs to call it once per recipient.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn deliver(&self, organization_id: &OrganizationID, user: &UserID, payload: &[u8]);
}

/// A `MessageSender` that drops every message, for tests and for running
/// the core standalone without a message subsystem wired in.
#[derive(Debug, Default)]
pub struct NullMessageSender;

#[async_trait::async_trait]
impl MessageSender for NullMessageSender {
    async fn deliver(&self, _organization_id: &OrganizationID, _user: &UserID, _payload: &[u8]) {}
}

impl Store {
    /// `start_reencryption(new_rev, per_user_msgs)` (spec §4.3).
    #[allow(clippy::too_many_arguments)]
    pub async fn start_reencryption(
        &self,
        organization_id: &OrganizationID,
        author: &DeviceID,
        event_bus: &EventBus,
        message_sender: &dyn MessageSender,
        realm_id: RealmID,
        new_revision: EncryptionRevision,
        per_user_messages: HashMap<UserID, Vec<u8>>,
        timestamp: Timestamp,
    ) -> Result<(), CoreError> {
        let org = self.org(organization_id);
        let entry_lock = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let mut entry = entry_lock.write().await;

        let role = entry.effective_role(&author.user_id());
        if role != Some(RealmRole::Owner) {
            return Err(CoreError::NotAllowed);
        }

        let RealmStatus::Normal {
            encryption_revision: old_revision,
        } = entry.status
        else {
            return Err(CoreError::InMaintenance(realm_id.to_string()));
        };
        if old_revision.next() != new_revision {
            return Err(CoreError::BadEncryptionRevision);
        }

        let participants = entry.current_participants();
        let recipients: HashSet<UserID> = per_user_messages.keys().cloned().collect();
        if recipients != participants {
            return Err(CoreError::MaintenanceError(
                "Realm participants and message recipients mismatch".to_string(),
            ));
        }

        let mut unmigrated = HashSet::new();
        for (vlob_id, record) in &entry.vlobs {
            for (index, version_entry) in record.versions.iter().enumerate() {
                if version_entry.encryption_revision == old_revision {
                    unmigrated.insert((*vlob_id, Version(index as u64 + 1)));
                }
            }
        }
        let total = unmigrated.len();

        entry.status = RealmStatus::Maintenance {
            maintenance_type: MaintenanceType::Reencryption,
            started_by: author.clone(),
            started_on: timestamp,
            encryption_revision: new_revision,
        };
        entry.reencryption = Some(ReencryptionState {
            target_revision: new_revision,
            total,
            unmigrated,
        });
        drop(entry);

        for (user, payload) in per_user_messages {
            message_sender.deliver(organization_id, &user, &payload).await;
        }

        event_bus.publish(
            organization_id,
            realm_id,
            Event::RealmMaintenanceStarted {
                realm_id,
                encryption_revision: new_revision,
            },
        );
        Ok(())
    }

    /// `finish_reencryption(new_rev)` (spec §4.3).
    pub async fn finish_reencryption(
        &self,
        organization_id: &OrganizationID,
        author: &DeviceID,
        event_bus: &EventBus,
        realm_id: RealmID,
        new_revision: EncryptionRevision,
    ) -> Result<(), CoreError> {
        let org = self.org(organization_id);
        let entry_lock = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let mut entry = entry_lock.write().await;

        let role = entry.effective_role(&author.user_id());
        if role != Some(RealmRole::Owner) {
            return Err(CoreError::NotAllowed);
        }

        let is_target_revision = matches!(
            &entry.status,
            RealmStatus::Maintenance { encryption_revision, .. } if *encryption_revision == new_revision
        );
        if !entry.status.is_in_maintenance() {
            return Err(CoreError::MaintenanceError(format!(
                "Realm `{realm_id}` not under maintenance"
            )));
        }
        if !is_target_revision {
            return Err(CoreError::BadEncryptionRevision);
        }

        let unmigrated_count = entry
            .reencryption
            .as_ref()
            .map(|r| r.unmigrated.len())
            .unwrap_or(0);
        if unmigrated_count != 0 {
            return Err(CoreError::MaintenanceError(format!(
                "Realm `{realm_id}` still has {unmigrated_count} unmigrated vlob version(s)"
            )));
        }

        entry.status = RealmStatus::Normal {
            encryption_revision: new_revision,
        };
        entry.reencryption = None;

        event_bus.publish(
            organization_id,
            realm_id,
            Event::RealmMaintenanceFinished {
                realm_id,
                encryption_revision: new_revision,
            },
        );
        Ok(())
    }
}
