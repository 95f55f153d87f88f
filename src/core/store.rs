// src/core/store.rs

//! The in-memory store backing every component. Organizations are
//! completely disjoint (spec §5 "nothing is shared across organizations"),
//! so the top-level `Store` is just a concurrent map of organization
//! shards; everything interesting happens one level down, inside a single
//! realm's entry.
//!
//! One realm's role log, status, vlob versions, checkpoint log, and
//! reencryption staging are all guarded by a single `tokio::sync::RwLock`
//! (spec §5: "per-(organization, realm_id) mutual exclusion must be
//! enforced around" exactly that list). This mirrors the granularity
//! `spineldb::core::storage::db::Db` uses for its `DbShard`s, just sharded
//! by realm instead of by key hash.

use crate::core::ids::{OrganizationID, RealmID, RealmRole, Timestamp, UserID, VlobID, Version};
use crate::core::realm::RoleCertificate;
use crate::core::realm::RealmStatus;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One stored version of a vlob.
#[derive(Debug, Clone)]
pub struct VlobVersionEntry {
    pub blob: Vec<u8>,
    pub author: crate::core::ids::DeviceID,
    pub timestamp: Timestamp,
    pub encryption_revision: crate::core::ids::EncryptionRevision,
}

/// A vlob's full version history.
#[derive(Debug, Clone, Default)]
pub struct VlobRecord {
    pub versions: Vec<VlobVersionEntry>,
}

impl VlobRecord {
    pub fn latest_version(&self) -> Version {
        Version(self.versions.len() as u64)
    }
}

/// Tracks an in-progress reencryption pass.
#[derive(Debug, Clone)]
pub struct ReencryptionState {
    pub target_revision: crate::core::ids::EncryptionRevision,
    pub total: usize,
    pub unmigrated: HashSet<(VlobID, Version)>,
}

/// Everything that belongs to one realm, guarded by a single lock.
#[derive(Debug)]
pub struct RealmEntry {
    pub created_on: Timestamp,
    pub roles_log: Vec<RoleCertificate>,
    pub status: RealmStatus,
    pub checkpoint: u64,
    /// Append-only, dense `1..=checkpoint`: `changes[i]` is the change
    /// committed at checkpoint `i + 1`.
    pub changes: Vec<(VlobID, Version)>,
    pub vlobs: IndexMap<VlobID, VlobRecord>,
    pub reencryption: Option<ReencryptionState>,
}

impl RealmEntry {
    fn new(created_on: Timestamp, creator: UserID, created_by: crate::core::ids::DeviceID) -> Self {
        let first_certificate = RoleCertificate {
            granted_by: created_by,
            granted_to: creator,
            role: Some(RealmRole::Owner),
            granted_on: created_on,
            signature: Vec::new(),
        };
        Self {
            created_on,
            roles_log: vec![first_certificate],
            status: RealmStatus::Normal {
                encryption_revision: crate::core::ids::EncryptionRevision::FIRST,
            },
            checkpoint: 0,
            changes: Vec::new(),
            vlobs: IndexMap::new(),
            reencryption: None,
        }
    }

    /// The effective role of `user`: the role of their latest certificate,
    /// or `None` if they have never been granted one or were last revoked.
    pub fn effective_role(&self, user: &UserID) -> Option<RealmRole> {
        self.roles_log
            .iter()
            .rev()
            .find(|cert| &cert.granted_to == user)
            .and_then(|cert| cert.role)
    }

    /// The set of users currently holding any non-`None` role.
    pub fn current_participants(&self) -> HashSet<UserID> {
        let mut latest: IndexMap<&UserID, Option<RealmRole>> = IndexMap::new();
        for cert in &self.roles_log {
            latest.insert(&cert.granted_to, cert.role);
        }
        latest
            .into_iter()
            .filter_map(|(user, role)| role.map(|_| user.clone()))
            .collect()
    }

    pub fn current_encryption_revision(&self) -> crate::core::ids::EncryptionRevision {
        self.status.encryption_revision()
    }
}

/// One organization's realms, plus a global index from vlob id to its
/// owning realm (vlob ids are unique and immutable-realm within an
/// organization, so this index never needs the realm lock to read).
#[derive(Debug, Default)]
pub struct OrgState {
    pub realms: DashMap<RealmID, Arc<RwLock<RealmEntry>>>,
    pub vlob_index: DashMap<VlobID, RealmID>,
}

/// The top-level store: organizations are disjoint shards, never compared
/// or iterated across.
#[derive(Debug, Default)]
pub struct Store {
    organizations: DashMap<OrganizationID, Arc<OrgState>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn org(&self, organization_id: &OrganizationID) -> Arc<OrgState> {
        self.organizations
            .entry(organization_id.clone())
            .or_insert_with(|| Arc::new(OrgState::default()))
            .value()
            .clone()
    }

    pub(crate) fn find_realm(
        &self,
        org: &OrgState,
        realm_id: RealmID,
    ) -> Option<Arc<RwLock<RealmEntry>>> {
        org.realms.get(&realm_id).map(|r| r.value().clone())
    }

    /// Creates a realm implicitly, seeding the role log with an OWNER
    /// certificate for `creator` (spec §3 "Lifecycles").
    pub(crate) fn get_or_create_realm(
        &self,
        org: &OrgState,
        realm_id: RealmID,
        creator: UserID,
        created_by: crate::core::ids::DeviceID,
        created_on: Timestamp,
    ) -> Arc<RwLock<RealmEntry>> {
        org.realms
            .entry(realm_id)
            .or_insert_with(|| Arc::new(RwLock::new(RealmEntry::new(created_on, creator, created_by))))
            .value()
            .clone()
    }
}
