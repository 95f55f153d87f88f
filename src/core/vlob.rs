// src/core/vlob.rs

//! The Vlob component (spec §4.2): a versioned blob store keyed by
//! `(organization, vlob_id)`, with a per-realm checkpoint counter and
//! reencryption staging area.

use crate::core::errors::CoreError;
use crate::core::events::{Event, EventBus};
use crate::core::ids::{DeviceID, EncryptionRevision, RealmID, Timestamp, VlobID, Version};
use crate::core::policy::OperationKind;
use crate::core::store::{Store, VlobRecord, VlobVersionEntry};
use std::collections::HashMap;

/// What `read` returns on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlobReadResult {
    pub version: Version,
    pub blob: Vec<u8>,
    pub author: DeviceID,
    pub timestamp: Timestamp,
}

/// What `poll_changes` returns on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollChangesResult {
    pub current_checkpoint: u64,
    pub changes: HashMap<VlobID, Version>,
}

/// One entry of a reencryption batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub vlob_id: VlobID,
    pub version: Version,
    pub data: Vec<u8>,
}

/// What `maintenance_save_reencryption_batch` returns on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveBatchResult {
    pub total: usize,
    pub done: usize,
}

fn ballpark_ok(timestamp: Timestamp, now: Timestamp, tolerance_secs: i64) -> bool {
    (timestamp - now).num_seconds().abs() <= tolerance_secs
}

impl Store {
    /// `create` (spec §4.2). Creates the realm implicitly if it doesn't
    /// exist yet, granting OWNER to `author`'s user.
    #[allow(clippy::too_many_arguments)]
    pub async fn vlob_create(
        &self,
        organization_id: &crate::core::ids::OrganizationID,
        author: &DeviceID,
        event_bus: &EventBus,
        realm_id: RealmID,
        vlob_id: VlobID,
        timestamp: Timestamp,
        now: Timestamp,
        ballpark_tolerance_secs: i64,
        blob: Vec<u8>,
        encryption_revision: Option<EncryptionRevision>,
    ) -> Result<(), CoreError> {
        if !ballpark_ok(timestamp, now, ballpark_tolerance_secs) {
            return Err(CoreError::BadTimestamp);
        }

        let org = self.org(organization_id);

        // Reserve `vlob_id` globally before touching any realm lock: two
        // concurrent creates racing on the same `vlob_id` under *different*
        // realms would otherwise both see an empty `vlob_index` entry and
        // both succeed, violating "each vlob is exclusively owned by one
        // realm" (spec §3). The reservation below is a single atomic
        // check-and-insert on `vlob_index`'s own entry, so only one of the
        // racers wins it; the loser is rejected before it ever reaches a
        // realm lock.
        match org.vlob_index.entry(vlob_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CoreError::VlobAlreadyExists(vlob_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(realm_id);
            }
        }

        let entry = self.get_or_create_realm(
            &org,
            realm_id,
            author.user_id(),
            author.clone(),
            timestamp,
        );
        let mut entry = entry.write().await;

        let role = entry.effective_role(&author.user_id());
        if let Err(err) = Store::enforce(role, OperationKind::DataWrite, &entry.status, realm_id) {
            org.vlob_index.remove(&vlob_id);
            return Err(err);
        }

        let current_rev = entry.current_encryption_revision();
        let expected_rev = encryption_revision.unwrap_or(current_rev);
        if expected_rev != current_rev {
            org.vlob_index.remove(&vlob_id);
            return Err(CoreError::BadEncryptionRevision);
        }

        entry.vlobs.insert(
            vlob_id,
            VlobRecord {
                versions: vec![VlobVersionEntry {
                    blob,
                    author: author.clone(),
                    timestamp,
                    encryption_revision: current_rev,
                }],
            },
        );
        entry.checkpoint += 1;
        entry.changes.push((vlob_id, Version::FIRST));
        let checkpoint = entry.checkpoint;
        drop(entry);

        event_bus.publish(
            organization_id,
            realm_id,
            Event::RealmVlobsUpdated {
                realm_id,
                checkpoint,
                src_id: vlob_id,
                src_version: Version::FIRST,
                author: author.clone(),
            },
        );
        Ok(())
    }

    /// `read` (spec §4.2).
    pub async fn vlob_read(
        &self,
        organization_id: &crate::core::ids::OrganizationID,
        author: &DeviceID,
        vlob_id: VlobID,
        version: Option<Version>,
        encryption_revision: Option<EncryptionRevision>,
    ) -> Result<VlobReadResult, CoreError> {
        let org = self.org(organization_id);
        let realm_id = *org
            .vlob_index
            .get(&vlob_id)
            .ok_or_else(|| CoreError::VlobNotFound(vlob_id.to_string()))?;
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::VlobNotFound(vlob_id.to_string()))?;
        let entry = entry.read().await;

        let role = entry.effective_role(&author.user_id());
        Store::enforce(role, OperationKind::DataRead, &entry.status, realm_id)?;

        let record = entry
            .vlobs
            .get(&vlob_id)
            .ok_or_else(|| CoreError::VlobNotFound(vlob_id.to_string()))?;

        let version = version.unwrap_or_else(|| record.latest_version());
        if version.0 == 0 || version.0 as usize > record.versions.len() {
            return Err(CoreError::BadVersion);
        }
        let stored = &record.versions[version.0 as usize - 1];

        if let Some(requested_rev) = encryption_revision
            && requested_rev != stored.encryption_revision
        {
            return Err(CoreError::BadEncryptionRevision);
        }

        Ok(VlobReadResult {
            version,
            blob: stored.blob.clone(),
            author: stored.author.clone(),
            timestamp: stored.timestamp,
        })
    }

    /// `update` (spec §4.2). `version` must equal `len(versions) + 1`:
    /// strict append, no gaps, no overwrite — this is the linearization
    /// point two concurrent writers race on.
    #[allow(clippy::too_many_arguments)]
    pub async fn vlob_update(
        &self,
        organization_id: &crate::core::ids::OrganizationID,
        author: &DeviceID,
        event_bus: &EventBus,
        vlob_id: VlobID,
        version: Version,
        timestamp: Timestamp,
        now: Timestamp,
        ballpark_tolerance_secs: i64,
        blob: Vec<u8>,
        encryption_revision: Option<EncryptionRevision>,
    ) -> Result<(), CoreError> {
        if !ballpark_ok(timestamp, now, ballpark_tolerance_secs) {
            return Err(CoreError::BadTimestamp);
        }

        let org = self.org(organization_id);
        let realm_id = *org
            .vlob_index
            .get(&vlob_id)
            .ok_or_else(|| CoreError::VlobNotFound(vlob_id.to_string()))?;
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::VlobNotFound(vlob_id.to_string()))?;
        let mut entry = entry.write().await;

        let role = entry.effective_role(&author.user_id());
        Store::enforce(role, OperationKind::DataWrite, &entry.status, realm_id)?;

        let current_rev = entry.current_encryption_revision();
        let expected_rev = encryption_revision.unwrap_or(current_rev);
        if expected_rev != current_rev {
            return Err(CoreError::BadEncryptionRevision);
        }

        let record = entry
            .vlobs
            .get_mut(&vlob_id)
            .ok_or_else(|| CoreError::VlobNotFound(vlob_id.to_string()))?;

        let next_version = Version(record.versions.len() as u64 + 1);
        if version != next_version {
            return Err(CoreError::BadVersion);
        }

        record.versions.push(VlobVersionEntry {
            blob,
            author: author.clone(),
            timestamp,
            encryption_revision: current_rev,
        });
        entry.checkpoint += 1;
        entry.changes.push((vlob_id, version));
        let checkpoint = entry.checkpoint;

        event_bus.publish(
            organization_id,
            realm_id,
            Event::RealmVlobsUpdated {
                realm_id,
                checkpoint,
                src_id: vlob_id,
                src_version: version,
                author: author.clone(),
            },
        );
        Ok(())
    }

    /// `poll_changes` (spec §4.2). Multiple entries for the same vlob
    /// collapse to the latest version observed since `last_checkpoint`.
    pub async fn vlob_poll_changes(
        &self,
        organization_id: &crate::core::ids::OrganizationID,
        author: &DeviceID,
        realm_id: RealmID,
        last_checkpoint: u64,
    ) -> Result<PollChangesResult, CoreError> {
        let org = self.org(organization_id);
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let entry = entry.read().await;

        let role = entry.effective_role(&author.user_id());
        Store::enforce(role, OperationKind::DataRead, &entry.status, realm_id)?;

        let mut changes: HashMap<VlobID, Version> = HashMap::new();
        if last_checkpoint < entry.checkpoint {
            for (vlob_id, version) in &entry.changes[last_checkpoint as usize..] {
                changes
                    .entry(*vlob_id)
                    .and_modify(|v| {
                        if version.0 > v.0 {
                            *v = *version;
                        }
                    })
                    .or_insert(*version);
            }
        }

        Ok(PollChangesResult {
            current_checkpoint: entry.checkpoint,
            changes,
        })
    }

    /// `maintenance_get_reencryption_batch` (spec §4.2). Returns up to
    /// `size` still-unmigrated entries, ordered by `(vlob_id, version)` so
    /// that repeated calls without intervening saves return the same head
    /// set (spec: idempotent).
    pub async fn vlob_maintenance_get_reencryption_batch(
        &self,
        organization_id: &crate::core::ids::OrganizationID,
        author: &DeviceID,
        realm_id: RealmID,
        encryption_revision: EncryptionRevision,
        size: usize,
    ) -> Result<Vec<BatchEntry>, CoreError> {
        let org = self.org(organization_id);
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let entry = entry.read().await;

        let role = entry.effective_role(&author.user_id());
        Store::enforce(role, OperationKind::Maintenance, &entry.status, realm_id)?;

        let Some(reencryption) = &entry.reencryption else {
            return Err(CoreError::MaintenanceError(format!(
                "Realm `{realm_id}` not under maintenance"
            )));
        };
        if reencryption.target_revision != encryption_revision {
            return Err(CoreError::BadEncryptionRevision);
        }

        let mut pairs: Vec<(VlobID, Version)> = reencryption.unmigrated.iter().copied().collect();
        pairs.sort_by_key(|(vlob_id, version)| (vlob_id.0, version.0));
        pairs.truncate(size);

        Ok(pairs
            .into_iter()
            .map(|(vlob_id, version)| {
                let stored =
                    &entry.vlobs[&vlob_id].versions[version.0 as usize - 1];
                BatchEntry {
                    vlob_id,
                    version,
                    data: stored.blob.clone(),
                }
            })
            .collect())
    }

    /// `maintenance_save_reencryption_batch` (spec §4.2). Entries absent
    /// from staging are ignored (idempotent re-submission).
    pub async fn vlob_maintenance_save_reencryption_batch(
        &self,
        organization_id: &crate::core::ids::OrganizationID,
        author: &DeviceID,
        realm_id: RealmID,
        encryption_revision: EncryptionRevision,
        batch: Vec<BatchEntry>,
    ) -> Result<SaveBatchResult, CoreError> {
        let org = self.org(organization_id);
        let entry = self
            .find_realm(&org, realm_id)
            .ok_or_else(|| CoreError::RealmNotFound(realm_id.to_string()))?;
        let mut entry = entry.write().await;

        let role = entry.effective_role(&author.user_id());
        Store::enforce(role, OperationKind::Maintenance, &entry.status, realm_id)?;

        {
            let Some(reencryption) = &entry.reencryption else {
                return Err(CoreError::MaintenanceError(format!(
                    "Realm `{realm_id}` not under maintenance"
                )));
            };
            if reencryption.target_revision != encryption_revision {
                return Err(CoreError::BadEncryptionRevision);
            }
        }

        for item in batch {
            let key = (item.vlob_id, item.version);
            let is_pending = entry
                .reencryption
                .as_ref()
                .is_some_and(|r| r.unmigrated.contains(&key));
            if !is_pending {
                // Already migrated or never staged: idempotent no-op.
                continue;
            }
            if let Some(record) = entry.vlobs.get_mut(&item.vlob_id) {
                let stored = &mut record.versions[item.version.0 as usize - 1];
                stored.blob = item.data;
                stored.encryption_revision = encryption_revision;
            }
            entry
                .reencryption
                .as_mut()
                .expect("checked above")
                .unmigrated
                .remove(&key);
        }

        let reencryption = entry.reencryption.as_ref().expect("checked above");
        let total = reencryption.total;
        let done = total - reencryption.unmigrated.len();
        Ok(SaveBatchResult { total, done })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{EncryptionRevision, OrganizationID, RealmID};
    use crate::core::maintenance::NullMessageSender;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn org() -> OrganizationID {
        OrganizationID("acme".to_string())
    }

    fn alice() -> DeviceID {
        DeviceID("alice@dev1".to_string())
    }

    #[tokio::test]
    async fn duplicate_vlob_id_is_rejected() {
        let store = Store::new();
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        let vlob_id = VlobID(Uuid::new_v4());
        let now = chrono::Utc::now();

        store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
            .await
            .unwrap();

        let err = store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1-again".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::VlobAlreadyExists(vlob_id.to_string()));

        // And from a different realm: `vlob_id` is unique across the whole
        // organization, not just within one realm.
        let other_realm = RealmID(Uuid::new_v4());
        let err = store
            .vlob_create(&org(), &alice(), &bus, other_realm, vlob_id, now, now, 300, b"elsewhere".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::VlobAlreadyExists(vlob_id.to_string()));
    }

    #[tokio::test]
    async fn write_outside_ballpark_is_rejected() {
        let store = Store::new();
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        let vlob_id = VlobID(Uuid::new_v4());
        let now = chrono::Utc::now();
        let stale = now - chrono::Duration::seconds(301);

        let err = store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, stale, now, 300, b"v1".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::BadTimestamp);

        store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
            .await
            .unwrap();

        let err = store
            .vlob_update(&org(), &alice(), &bus, vlob_id, Version(2), stale, now, 300, b"v2".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::BadTimestamp);
    }

    #[tokio::test]
    async fn poll_changes_at_or_past_current_checkpoint_is_empty() {
        let store = Store::new();
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        let vlob_id = VlobID(Uuid::new_v4());
        let now = chrono::Utc::now();

        store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
            .await
            .unwrap();

        let result = store
            .vlob_poll_changes(&org(), &alice(), realm_id, 1)
            .await
            .unwrap();
        assert_eq!(result.current_checkpoint, 1);
        assert!(result.changes.is_empty());

        let result = store
            .vlob_poll_changes(&org(), &alice(), realm_id, 5)
            .await
            .unwrap();
        assert!(result.changes.is_empty());
    }

    #[tokio::test]
    async fn resubmitting_the_same_save_batch_is_a_no_op() {
        let store = Store::new();
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        let vlob_id = VlobID(Uuid::new_v4());
        let now = chrono::Utc::now();

        store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
            .await
            .unwrap();

        let mut messages = HashMap::new();
        messages.insert(crate::core::ids::UserID("alice".to_string()), b"key".to_vec());
        store
            .start_reencryption(
                &org(),
                &alice(),
                &bus,
                &NullMessageSender,
                realm_id,
                EncryptionRevision(2),
                messages,
                now,
            )
            .await
            .unwrap();

        let batch = store
            .vlob_maintenance_get_reencryption_batch(&org(), &alice(), realm_id, EncryptionRevision(2), 10)
            .await
            .unwrap();
        let reencrypted: Vec<BatchEntry> = batch
            .into_iter()
            .map(|entry| BatchEntry {
                vlob_id: entry.vlob_id,
                version: entry.version,
                data: b"reencrypted".to_vec(),
            })
            .collect();

        let first = store
            .vlob_maintenance_save_reencryption_batch(&org(), &alice(), realm_id, EncryptionRevision(2), reencrypted.clone())
            .await
            .unwrap();
        assert_eq!(first, SaveBatchResult { total: 1, done: 1 });

        // Re-submitting the identical batch is `ok` and changes nothing.
        let second = store
            .vlob_maintenance_save_reencryption_batch(&org(), &alice(), realm_id, EncryptionRevision(2), reencrypted)
            .await
            .unwrap();
        assert_eq!(second, SaveBatchResult { total: 1, done: 1 });
    }

    #[tokio::test]
    async fn reencryption_maintenance_is_owner_only() {
        let store = Store::new();
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        let vlob_id = VlobID(Uuid::new_v4());
        let now = chrono::Utc::now();
        let bob = DeviceID("bob@dev1".to_string());

        store
            .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
            .await
            .unwrap();
        store
            .update_roles(
                &org(),
                &alice(),
                &bus,
                realm_id,
                crate::core::ids::UserID("bob".to_string()),
                Some(crate::core::ids::RealmRole::Manager),
                now + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let mut messages = HashMap::new();
        messages.insert(crate::core::ids::UserID("alice".to_string()), b"key".to_vec());
        messages.insert(crate::core::ids::UserID("bob".to_string()), b"key".to_vec());
        store
            .start_reencryption(
                &org(),
                &alice(),
                &bus,
                &NullMessageSender,
                realm_id,
                EncryptionRevision(2),
                messages,
                now + chrono::Duration::seconds(2),
            )
            .await
            .unwrap();

        // Bob is a MANAGER, not the OWNER: maintenance batch operations are
        // OWNER-only (spec §4.1 `MAINTENANCE` row), same as start/finish.
        let err = store
            .vlob_maintenance_get_reencryption_batch(&org(), &bob, realm_id, EncryptionRevision(2), 10)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::NotAllowed);

        let err = store
            .vlob_maintenance_save_reencryption_batch(&org(), &bob, realm_id, EncryptionRevision(2), vec![])
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::NotAllowed);
    }
}

