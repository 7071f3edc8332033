//! Multi-device tests: several engines sharing one in-memory mirror.
//!
//! Each device has its own filesystem and manually driven wall clock, so
//! timestamps are fully controlled by the test.

use std::collections::BTreeSet;
use std::sync::Arc;

use notesync_core::{
    DeviceId, HybridClock, InMemoryDocumentStore, InMemoryFs, ManualClock, NoteEdit, RetryPolicy,
    Snapshot, SyncConfig, SyncContext, SyncEngine, SyncKey, SyncStatus, UNSORTED_FOLDER_ID,
};
use proptest::prelude::*;
use uuid::Uuid;

type Engine = SyncEngine<Arc<InMemoryFs>, Arc<InMemoryDocumentStore>>;

const KEY: &str = "shared test sync key";

/// One simulated device.
struct Device {
    wall: Arc<ManualClock>,
    engine: Engine,
}

impl Device {
    async fn open(id: u64, remote: &Arc<InMemoryDocumentStore>, start_ms: u64) -> Self {
        let wall = Arc::new(ManualClock::new(start_ms));
        let ctx = SyncContext::new(
            DeviceId::from(id),
            SyncKey::new(KEY).unwrap(),
            HybridClock::new(wall.clone()),
        );
        let config = SyncConfig {
            retry: RetryPolicy::immediate(3),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::open(Arc::new(InMemoryFs::new()), remote.clone(), ctx, config)
            .await
            .unwrap();
        Self { wall, engine }
    }
}

/// Drive every connected device until no remote changes are left in flight.
async fn settle(devices: &mut [Device]) {
    for _ in 0..20 {
        let mut received = 0;
        for device in devices.iter_mut() {
            if device.engine.is_subscribed() {
                received += device.engine.process_pending().await.unwrap().received;
                device.engine.flush().await.unwrap();
            }
        }
        if received == 0 {
            return;
        }
    }
    panic!("devices did not settle");
}

fn assert_converged(devices: &[Device]) -> Snapshot {
    let first = devices[0].engine.snapshot();
    for device in &devices[1..] {
        assert_eq!(device.engine.snapshot(), first);
    }
    first
}

#[tokio::test]
async fn test_concurrent_edits_to_different_fields_both_survive() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut devices = vec![
        Device::open(1, &remote, 1).await,
        Device::open(2, &remote, 1).await,
    ];
    for d in devices.iter_mut() {
        d.engine.connect().await.unwrap();
    }

    let folder = devices[0].engine.create_folder("F1").await.unwrap();
    let note = devices[0]
        .engine
        .create_note(folder, "N1", "", Vec::<String>::new())
        .await
        .unwrap();
    devices[0].engine.flush().await.unwrap();
    settle(&mut devices).await;

    // Both devices go offline and edit different fields
    for d in devices.iter_mut() {
        d.engine.sign_out();
        d.wall.advance(10);
    }
    devices[0]
        .engine
        .edit_note(note, NoteEdit::title("Draft"))
        .await
        .unwrap();
    devices[1]
        .engine
        .edit_note(note, NoteEdit::tags(["urgent"]))
        .await
        .unwrap();

    for d in devices.iter_mut() {
        d.engine.connect().await.unwrap();
    }
    settle(&mut devices).await;

    let snapshot = assert_converged(&devices);
    let merged = snapshot.notes.iter().find(|n| n.id == note).unwrap();
    assert_eq!(merged.title, "Draft");
    assert_eq!(merged.tags, BTreeSet::from(["urgent".to_string()]));
    assert_eq!(merged.folder_id, folder);
}

#[tokio::test]
async fn test_later_delete_beats_earlier_edit() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut devices = vec![
        Device::open(1, &remote, 1).await,
        Device::open(2, &remote, 1).await,
    ];
    for d in devices.iter_mut() {
        d.engine.connect().await.unwrap();
    }
    let note = devices[0]
        .engine
        .create_note(UNSORTED_FOLDER_ID, "N2", "first", Vec::<String>::new())
        .await
        .unwrap();
    devices[0].engine.flush().await.unwrap();
    settle(&mut devices).await;

    for d in devices.iter_mut() {
        d.engine.sign_out();
    }
    devices[0].wall.set(4);
    devices[0]
        .engine
        .edit_note(note, NoteEdit::body("edited"))
        .await
        .unwrap();
    devices[1].wall.set(5);
    devices[1].engine.delete_note(note).await.unwrap();

    // The editing device reconnects last, so its push lands on top
    devices[1].engine.connect().await.unwrap();
    devices[0].engine.connect().await.unwrap();
    settle(&mut devices).await;

    let snapshot = assert_converged(&devices);
    assert!(snapshot.notes.iter().find(|n| n.id == note).unwrap().deleted);
    assert!(devices[0].engine.notes_in(UNSORTED_FOLDER_ID).is_empty());
}

#[tokio::test]
async fn test_deleted_folder_reparents_notes_everywhere() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut devices = vec![
        Device::open(1, &remote, 1).await,
        Device::open(2, &remote, 1).await,
    ];
    for d in devices.iter_mut() {
        d.engine.connect().await.unwrap();
    }
    let folder = devices[0].engine.create_folder("Projects").await.unwrap();
    devices[0].engine.flush().await.unwrap();
    settle(&mut devices).await;

    // B files a note under the folder while A deletes it
    devices[0].wall.advance(5);
    devices[1].wall.advance(5);
    devices[0].engine.delete_folder(folder).await.unwrap();
    let note = devices[1]
        .engine
        .create_note(folder, "orphan", "", Vec::<String>::new())
        .await
        .unwrap();
    for d in devices.iter_mut() {
        d.engine.flush().await.unwrap();
    }
    settle(&mut devices).await;

    assert_converged(&devices);
    for d in &devices {
        let unsorted = d.engine.notes_in(UNSORTED_FOLDER_ID);
        assert_eq!(unsorted.len(), 1);
        assert_eq!(unsorted[0].id, note);
    }
}

#[tokio::test]
async fn test_offline_edits_reach_the_mirror_on_reconnect() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut devices = vec![
        Device::open(1, &remote, 100).await,
        Device::open(2, &remote, 100).await,
    ];
    devices[1].engine.connect().await.unwrap();

    let folder = devices[0].engine.create_folder("Offline").await.unwrap();
    devices[0]
        .engine
        .create_note(folder, "written offline", "", ["travel"])
        .await
        .unwrap();
    assert_eq!(devices[0].engine.status(), &SyncStatus::Offline);
    assert_eq!(remote.upsert_count(), 0);

    devices[0].engine.connect().await.unwrap();
    settle(&mut devices).await;

    assert_converged(&devices);
    assert_eq!(devices[1].engine.notes_in(folder).len(), 1);
    assert_eq!(devices[0].engine.pending_pushes(), 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut device = Device::open(1, &remote, 1).await;
    device.engine.connect().await.unwrap();

    remote.fail_next(2);
    device.engine.create_folder("Flaky").await.unwrap();
    device.engine.flush().await.unwrap();

    assert_eq!(device.engine.status(), &SyncStatus::Online);
    assert_eq!(device.engine.pending_pushes(), 0);
    assert_eq!(remote.upsert_count(), 1);
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut devices = vec![
        Device::open(1, &remote, 1).await,
        Device::open(2, &remote, 1).await,
    ];
    for d in devices.iter_mut() {
        d.engine.connect().await.unwrap();
    }
    let folder = devices[0].engine.create_folder("Once").await.unwrap();
    devices[0]
        .engine
        .create_note(folder, "n", "b", ["x"])
        .await
        .unwrap();
    devices[0].engine.flush().await.unwrap();
    settle(&mut devices).await;
    let before = assert_converged(&devices);
    let upserts = remote.upsert_count();

    let collection = devices[0].engine.mirror().collection().to_string();
    remote.redeliver(&collection);
    remote.redeliver(&collection);
    let report = devices[1].engine.process_pending().await.unwrap();
    assert!(report.received > 0);
    assert_eq!(report.applied, 0);
    assert_eq!(report.pushed_back, 0);
    settle(&mut devices).await;

    assert_eq!(assert_converged(&devices), before);
    assert_eq!(remote.upsert_count(), upserts);
}

#[tokio::test]
async fn test_malformed_remote_documents_are_skipped() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut device = Device::open(1, &remote, 1).await;
    device.engine.connect().await.unwrap();
    let collection = device.engine.mirror().collection().to_string();

    remote.inject(&collection, Uuid::new_v4(), serde_json::json!({"garbage": true}));
    let report = device.engine.process_pending().await.unwrap();
    assert_eq!(report.received, 0);
    assert_eq!(device.engine.status(), &SyncStatus::Online);
}

#[tokio::test]
async fn test_backup_restores_on_a_fresh_device() {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut source = Device::open(1, &remote, 1).await;
    let folder = source.engine.create_folder("Archive").await.unwrap();
    let note = source
        .engine
        .create_note(folder, "kept", "body", ["a", "b"])
        .await
        .unwrap();
    source.wall.advance(3);
    source.engine.delete_note(note).await.unwrap();

    let text = source.engine.export_backup().to_json().unwrap();
    let parsed = notesync_core::BackupDocument::parse(&text).unwrap();

    let mut target = Device::open(2, &Arc::new(InMemoryDocumentStore::new()), 1).await;
    target.engine.import_backup(&parsed).await.unwrap();
    assert_eq!(target.engine.snapshot(), source.engine.snapshot());
}

#[derive(Debug, Clone)]
enum Op {
    CreateFolder { device: usize },
    CreateNote { device: usize, folder: usize },
    Rename { device: usize, note: usize, title: String },
    Tag { device: usize, note: usize, tag: String },
    Move { device: usize, note: usize, folder: usize },
    DeleteNote { device: usize, note: usize },
    DeleteFolder { device: usize, folder: usize },
    Sync { device: usize },
    Tick { device: usize, ms: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    let device = 0..3usize;
    prop_oneof![
        device.clone().prop_map(|device| Op::CreateFolder { device }),
        (device.clone(), 0..4usize).prop_map(|(device, folder)| Op::CreateNote { device, folder }),
        (device.clone(), 0..6usize, "[a-z]{1,5}")
            .prop_map(|(device, note, title)| Op::Rename { device, note, title }),
        (device.clone(), 0..6usize, "[a-z]{1,3}")
            .prop_map(|(device, note, tag)| Op::Tag { device, note, tag }),
        (device.clone(), 0..6usize, 0..4usize)
            .prop_map(|(device, note, folder)| Op::Move { device, note, folder }),
        (device.clone(), 0..6usize).prop_map(|(device, note)| Op::DeleteNote { device, note }),
        (device.clone(), 1..4usize).prop_map(|(device, folder)| Op::DeleteFolder { device, folder }),
        device.clone().prop_map(|device| Op::Sync { device }),
        (device, 0..3u64).prop_map(|(device, ms)| Op::Tick { device, ms }),
    ]
}

/// Run `ops` on three devices, then let everyone catch up.
async fn run(ops: Vec<Op>) -> Vec<Device> {
    let remote = Arc::new(InMemoryDocumentStore::new());
    let mut devices = Vec::new();
    for id in 1..=3 {
        let mut device = Device::open(id, &remote, 1).await;
        device.engine.connect().await.unwrap();
        devices.push(device);
    }

    let mut folders = vec![UNSORTED_FOLDER_ID];
    let mut notes: Vec<Uuid> = Vec::new();
    for op in ops {
        // Intents referring to entities a device has not seen yet are
        // rejected; that is fine here.
        match op {
            Op::CreateFolder { device } => {
                if let Ok(id) = devices[device].engine.create_folder("f").await {
                    folders.push(id);
                }
            }
            Op::CreateNote { device, folder } => {
                let folder = folders[folder % folders.len()];
                if let Ok(id) = devices[device]
                    .engine
                    .create_note(folder, "n", "", Vec::<String>::new())
                    .await
                {
                    notes.push(id);
                }
            }
            Op::Rename { device, note, title } if !notes.is_empty() => {
                let note = notes[note % notes.len()];
                let _ = devices[device].engine.edit_note(note, NoteEdit::title(title)).await;
            }
            Op::Tag { device, note, tag } if !notes.is_empty() => {
                let note = notes[note % notes.len()];
                let _ = devices[device].engine.edit_note(note, NoteEdit::tags([tag])).await;
            }
            Op::Move { device, note, folder } if !notes.is_empty() => {
                let note = notes[note % notes.len()];
                let folder = folders[folder % folders.len()];
                let _ = devices[device].engine.move_note(note, folder).await;
            }
            Op::DeleteNote { device, note } if !notes.is_empty() => {
                let note = notes[note % notes.len()];
                let _ = devices[device].engine.delete_note(note).await;
            }
            Op::DeleteFolder { device, folder } if folders.len() > 1 => {
                let folder = folders[1 + folder % (folders.len() - 1)];
                let _ = devices[device].engine.delete_folder(folder).await;
            }
            Op::Sync { device } => {
                let engine = &mut devices[device].engine;
                engine.flush().await.unwrap();
                engine.process_pending().await.unwrap();
            }
            Op::Tick { device, ms } => devices[device].wall.advance(ms),
            _ => {}
        }
    }

    for device in devices.iter_mut() {
        device.engine.flush().await.unwrap();
    }
    settle(&mut devices).await;
    devices
}

fn block_on<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_devices_converge(ops in prop::collection::vec(op(), 1..40)) {
        let devices = block_on(run(ops));
        let first = devices[0].engine.snapshot();
        for device in &devices[1..] {
            prop_assert_eq!(&device.engine.snapshot(), &first);
        }
    }

    #[test]
    fn prop_redelivery_changes_nothing(ops in prop::collection::vec(op(), 1..30)) {
        block_on(async {
            let mut devices = run(ops).await;
            let before = devices[0].engine.snapshot();
            let collection = devices[0].engine.mirror().collection().to_string();
            devices[0].engine.mirror().store().redeliver(&collection);
            let report = devices[0].engine.process_pending().await.unwrap();
            assert_eq!(report.applied, 0);
            settle(&mut devices).await;
            assert_eq!(devices[0].engine.snapshot(), before);
        });
    }
}
