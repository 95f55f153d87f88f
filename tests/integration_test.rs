//! End-to-end scenarios from spec.md §8, replayed against the public
//! `Store`/`EventBus` API the way `spineldb`'s crate-level integration
//! tests exercise full command sequences rather than single functions.

use std::time::Duration;
use uuid::Uuid;
use vlobd::core::errors::CoreError;
use vlobd::core::events::EventBus;
use vlobd::core::ids::{DeviceID, EncryptionRevision, OrganizationID, RealmID, UserID, Version, VlobID};
use vlobd::core::maintenance::NullMessageSender;
use vlobd::core::store::Store;

fn org() -> OrganizationID {
    OrganizationID("acme".to_string())
}

fn alice() -> DeviceID {
    DeviceID("alice@laptop".to_string())
}

fn bob() -> DeviceID {
    DeviceID("bob@phone".to_string())
}

#[tokio::test]
async fn scenario_1_create_read_round_trip() {
    let store = Store::new();
    let bus = EventBus::new();
    let realm_id = RealmID(Uuid::new_v4());
    let vlob_id = VlobID(Uuid::new_v4());
    let now = chrono::Utc::now();

    store
        .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
        .await
        .unwrap();

    let read = store
        .vlob_read(&org(), &alice(), vlob_id, None, None)
        .await
        .unwrap();

    assert_eq!(read.version, Version::FIRST);
    assert_eq!(read.blob, b"v1");
    assert_eq!(read.author, alice());
}

#[tokio::test]
async fn scenario_2_concurrent_update_race() {
    let store = std::sync::Arc::new(Store::new());
    let bus = std::sync::Arc::new(EventBus::new());
    let realm_id = RealmID(Uuid::new_v4());
    let vlob_id = VlobID(Uuid::new_v4());
    let now = chrono::Utc::now();

    store
        .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..2 {
        let store = store.clone();
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            store
                .vlob_update(
                    &org(),
                    &alice(),
                    &bus,
                    vlob_id,
                    Version(2),
                    now,
                    now,
                    300,
                    format!("v2-from-{i}").into_bytes(),
                    None,
                )
                .await
        }));
    }

    let results: Vec<_> = futures_join_all(tasks).await;
    let oks = results.iter().filter(|r| r.is_ok()).count();
    let bad_versions = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::BadVersion)))
        .count();

    assert_eq!(oks, 1, "exactly one writer should win the race");
    assert_eq!(bad_versions, 1, "the loser should see bad_version");

    let read = store.vlob_read(&org(), &alice(), vlob_id, None, None).await.unwrap();
    assert_eq!(read.version, Version(2));
}

async fn futures_join_all(
    tasks: Vec<tokio::task::JoinHandle<Result<(), CoreError>>>,
) -> Vec<Result<(), CoreError>> {
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        out.push(task.await.expect("task should not panic"));
    }
    out
}

#[tokio::test]
async fn scenario_3_access_denied_for_stranger() {
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
        .vlob_read(&org(), &bob(), vlob_id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::NotAllowed);
}

#[tokio::test]
async fn scenario_4_reencryption_happy_path() {
    let store = Store::new();
    let bus = EventBus::new();
    let realm_id = RealmID(Uuid::new_v4());
    let v1 = VlobID(Uuid::new_v4());
    let v2 = VlobID(Uuid::new_v4());
    let now = chrono::Utc::now();

    store
        .vlob_create(&org(), &alice(), &bus, realm_id, v1, now, now, 300, b"v1-r1".to_vec(), None)
        .await
        .unwrap();
    store
        .vlob_update(&org(), &alice(), &bus, v1, Version(2), now, now, 300, b"v1-r2".to_vec(), None)
        .await
        .unwrap();
    store
        .vlob_create(&org(), &alice(), &bus, realm_id, v2, now, now, 300, b"v2-r1".to_vec(), None)
        .await
        .unwrap();

    let mut messages = std::collections::HashMap::new();
    messages.insert(UserID("alice".to_string()), b"new key".to_vec());
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

    let write_err = store
        .vlob_update(&org(), &alice(), &bus, v1, Version(3), now, now, 300, b"denied".to_vec(), None)
        .await
        .unwrap_err();
    assert_eq!(write_err, CoreError::InMaintenance(realm_id.to_string()));

    let batch = store
        .vlob_maintenance_get_reencryption_batch(&org(), &alice(), realm_id, EncryptionRevision(2), 10)
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);

    let reencrypted = batch
        .into_iter()
        .map(|entry| vlobd::core::vlob::BatchEntry {
            vlob_id: entry.vlob_id,
            version: entry.version,
            data: [b"reencrypted-".as_slice(), &entry.data].concat(),
        })
        .collect();
    let result = store
        .vlob_maintenance_save_reencryption_batch(&org(), &alice(), realm_id, EncryptionRevision(2), reencrypted)
        .await
        .unwrap();
    assert_eq!(result.total, 3);
    assert_eq!(result.done, 3);

    store
        .finish_reencryption(&org(), &alice(), &bus, realm_id, EncryptionRevision(2))
        .await
        .unwrap();

    let read = store
        .vlob_read(&org(), &alice(), v1, Some(Version(2)), Some(EncryptionRevision(2)))
        .await
        .unwrap();
    assert_eq!(read.blob, b"reencrypted-v1-r2");
}

#[tokio::test]
async fn scenario_5_participant_mismatch() {
    let store = Store::new();
    let bus = EventBus::new();
    let realm_id = RealmID(Uuid::new_v4());
    let vlob_id = VlobID(Uuid::new_v4());
    let now = chrono::Utc::now();

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
            UserID("bob".to_string()),
            Some(vlobd::core::ids::RealmRole::Reader),
            now + chrono::Duration::seconds(1),
        )
        .await
        .unwrap();

    let mut messages = std::collections::HashMap::new();
    messages.insert(UserID("alice".to_string()), b"key".to_vec());
    let err = store
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
        .unwrap_err();

    assert_eq!(
        err,
        CoreError::MaintenanceError("Realm participants and message recipients mismatch".to_string())
    );

    let status = store.get_status(&org(), &alice().user_id(), realm_id).await.unwrap();
    assert!(!status.in_maintenance);
}

#[tokio::test]
async fn scenario_6_double_start_rejected() {
    let store = Store::new();
    let bus = EventBus::new();
    let realm_id = RealmID(Uuid::new_v4());
    let vlob_id = VlobID(Uuid::new_v4());
    let now = chrono::Utc::now();

    store
        .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
        .await
        .unwrap();

    let mut messages = std::collections::HashMap::new();
    messages.insert(UserID("alice".to_string()), b"key".to_vec());
    store
        .start_reencryption(&org(), &alice(), &bus, &NullMessageSender, realm_id, EncryptionRevision(2), messages.clone(), now)
        .await
        .unwrap();

    for rev in [EncryptionRevision(2), EncryptionRevision(3)] {
        let err = store
            .start_reencryption(&org(), &alice(), &bus, &NullMessageSender, realm_id, rev, messages.clone(), now)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::InMaintenance(realm_id.to_string()));
    }
}

/// Beyond the six named scenarios: a lagged `events_listen` subscriber
/// must be able to tell something happened even if it missed the event,
/// by falling back to `poll_changes` (spec §4.4 "at-least-once").
#[tokio::test]
async fn poll_changes_recovers_from_a_missed_event() {
    let store = Store::new();
    let bus = EventBus::new();
    let realm_id = RealmID(Uuid::new_v4());
    let vlob_id = VlobID(Uuid::new_v4());
    let now = chrono::Utc::now();

    store
        .vlob_create(&org(), &alice(), &bus, realm_id, vlob_id, now, now, 300, b"v1".to_vec(), None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_millis(10), async {})
        .await
        .unwrap();

    let result = store.vlob_poll_changes(&org(), &alice(), realm_id, 0).await.unwrap();
    assert_eq!(result.current_checkpoint, 1);
    assert_eq!(result.changes.get(&vlob_id), Some(&Version::FIRST));
}
