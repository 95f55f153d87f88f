// src/core/events.rs

//! The event bus: in-process publish/subscribe of realm-scoped events,
//! consumed by long-poll subscribers (the `events_listen` command).
//!
//! Modeled on `spineldb::core::pubsub::PubSubManager`: one lazily-created
//! broadcast channel per topic, looked up in a `DashMap`, with a purge pass
//! to drop channels nobody is listening to anymore.

use crate::core::ids::{DeviceID, EncryptionRevision, OrganizationID, RealmID, UserID, VlobID};
use crate::core::ids::Version;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// The capacity of each per-realm broadcast channel. A slow listener that
/// falls behind this many events will observe a `Lagged` error and should
/// resynchronize via `poll_changes` rather than trust the event stream.
const CHANNEL_CAPACITY: usize = 256;

/// A realm-scoped event, as described in spec §4.4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RealmVlobsUpdated {
        realm_id: RealmID,
        checkpoint: u64,
        src_id: VlobID,
        src_version: Version,
        author: DeviceID,
    },
    RealmRolesUpdated {
        realm_id: RealmID,
        user: UserID,
    },
    RealmMaintenanceStarted {
        realm_id: RealmID,
        encryption_revision: EncryptionRevision,
    },
    RealmMaintenanceFinished {
        realm_id: RealmID,
        encryption_revision: EncryptionRevision,
    },
}

/// Identifies a single realm's event topic within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Topic {
    organization_id: OrganizationID,
    realm_id: RealmID,
}

/// `EventBus` is the central distribution hub for realm-scoped events.
/// Delivery is best-effort, at-least-once within this process (spec §4.4):
/// a lagged subscriber must recover via `poll_changes`, never treat a
/// missed event as "nothing happened".
#[derive(Debug, Default)]
pub struct EventBus {
    channels: DashMap<Topic, Arc<Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to all subscribers of its realm. A publish with
    /// no active subscribers is not an error.
    pub fn publish(&self, organization_id: &OrganizationID, realm_id: RealmID, event: Event) {
        let topic = Topic {
            organization_id: organization_id.clone(),
            realm_id,
        };
        if let Some(sender) = self.channels.get(&topic)
            && sender.send(event).is_err()
        {
            debug!(%realm_id, "published an event with no active subscribers");
        }
    }

    /// Subscribes to a realm's event topic, creating it if necessary.
    pub fn subscribe(&self, organization_id: &OrganizationID, realm_id: RealmID) -> Receiver<Event> {
        let topic = Topic {
            organization_id: organization_id.clone(),
            realm_id,
        };
        self.channels
            .entry(topic)
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Removes topics that no longer have any subscribers, preventing an
    /// unbounded accumulation of empty channels across realm churn.
    pub fn purge_empty_topics(&self) -> usize {
        let mut purged = 0;
        self.channels.retain(|_topic, sender| {
            if sender.receiver_count() == 0 {
                purged += 1;
                false
            } else {
                true
            }
        });
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn org() -> OrganizationID {
        OrganizationID("acme".to_string())
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        let mut rx = bus.subscribe(&org(), realm_id);

        bus.publish(
            &org(),
            realm_id,
            Event::RealmVlobsUpdated {
                realm_id,
                checkpoint: 1,
                src_id: VlobID(Uuid::new_v4()),
                src_version: Version::FIRST,
                author: crate::core::ids::DeviceID("alice@dev1".to_string()),
            },
        );

        let received = rx.recv().await.unwrap();
        match received {
            Event::RealmVlobsUpdated { checkpoint, .. } => assert_eq!(checkpoint, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn purge_drops_topics_with_no_subscribers() {
        let bus = EventBus::new();
        let realm_id = RealmID(Uuid::new_v4());
        {
            let _rx = bus.subscribe(&org(), realm_id);
            assert_eq!(bus.channels.len(), 1);
        }
        assert_eq!(bus.purge_empty_topics(), 1);
        assert!(bus.channels.is_empty());
    }
}
