//! Applying the same set of writes in any order, with duplicates and partial
//! deliveries, yields the same entity store.

use std::collections::{BTreeMap, BTreeSet};

use notesync_core::clock::Timestamp;
use notesync_core::reconcile::Reconciler;
use notesync_core::{
    ChangeRecord, DeviceId, EntityKind, EntityStore, Field, FieldValue, ResurrectionPolicy,
    Snapshot, UNSORTED_FOLDER_ID,
};
use proptest::prelude::*;
use uuid::Uuid;

const FOLDERS: [u128; 3] = [0xf1, 0xf2, 0xf3];
const NOTES: [u128; 3] = [0xa1, 0xa2, 0xa3];
const POLICIES: [ResurrectionPolicy; 2] = [
    ResurrectionPolicy::ResurrectOnEdit,
    ResurrectionPolicy::TombstoneWins,
];

/// One generated write: `(entity, wall, counter, device, fields)`.
type Write = (usize, u64, u32, u64, Vec<(u8, u8)>);

fn entity(index: usize) -> (Uuid, EntityKind) {
    if index < FOLDERS.len() {
        (Uuid::from_u128(FOLDERS[index]), EntityKind::Folder)
    } else {
        (Uuid::from_u128(NOTES[index - FOLDERS.len()]), EntityKind::Note)
    }
}

fn value(field: Field, v: u8) -> FieldValue {
    match field {
        Field::Name | Field::Title | Field::Body => FieldValue::Text(format!("v{}", v % 4)),
        Field::CreatedAt => FieldValue::Time(Timestamp::new(u64::from(v % 4), 0)),
        Field::OrderHint => FieldValue::Number(f64::from(v % 4)),
        Field::FolderId => match usize::from(v % 4) {
            3 => FieldValue::Id(UNSORTED_FOLDER_ID),
            i => FieldValue::Id(Uuid::from_u128(FOLDERS[i])),
        },
        Field::Tags => FieldValue::Tags(
            (0..v % 3).map(|t| format!("tag{}", t)).collect::<BTreeSet<_>>(),
        ),
        Field::Deleted => FieldValue::Flag(v % 3 != 0),
    }
}

fn record((index, wall, counter, device, picks): Write) -> ChangeRecord {
    let (entity_id, entity_kind) = entity(index);
    let allowed: &[Field] = match entity_kind {
        EntityKind::Folder => &Field::FOLDER_FIELDS,
        EntityKind::Note => &Field::NOTE_FIELDS,
    };
    let fields_changed = picks
        .into_iter()
        .map(|(pick, v)| {
            let field = allowed[usize::from(pick) % allowed.len()];
            (field, value(field, v))
        })
        .collect();
    ChangeRecord {
        entity_id,
        entity_kind,
        fields_changed,
        timestamp: Timestamp::new(wall, counter),
        origin_device: DeviceId::from(device),
    }
}

/// Distinct writes. A stamp identifies one write per entity, so a later
/// write reusing `(stamp, entity)` is dropped.
fn writes() -> impl Strategy<Value = Vec<ChangeRecord>> {
    let write = (
        0..FOLDERS.len() + NOTES.len(),
        // Narrow ranges so clock values collide across devices
        1u64..4,
        0u32..2,
        1u64..4,
        prop::collection::vec((any::<u8>(), any::<u8>()), 1..4),
    );
    prop::collection::vec(write, 1..24).prop_map(|writes| {
        let mut unique: BTreeMap<_, ChangeRecord> = BTreeMap::new();
        for write in writes {
            let record = record(write);
            unique
                .entry((record.stamp(), record.entity_id))
                .or_insert(record);
        }
        unique.into_values().collect()
    })
}

/// Every write delivered whole, every other one twice, and multi-field
/// writes also one field at a time.
fn deliveries(records: &[ChangeRecord]) -> Vec<ChangeRecord> {
    let mut out = Vec::new();
    for (i, record) in records.iter().enumerate() {
        out.push(record.clone());
        if i % 2 == 0 {
            out.push(record.clone());
        }
        if record.fields_changed.len() > 1 {
            for (field, value) in &record.fields_changed {
                let mut part = record.clone();
                part.fields_changed = [(*field, value.clone())].into();
                out.push(part);
            }
        }
    }
    out
}

fn scenario() -> impl Strategy<Value = (Vec<ChangeRecord>, Vec<ChangeRecord>, Vec<ChangeRecord>)> {
    writes().prop_flat_map(|records| {
        let delivered = deliveries(&records);
        (
            Just(records),
            Just(delivered.clone()).prop_shuffle(),
            Just(delivered).prop_shuffle(),
        )
    })
}

/// Drain after every single record, the way a live feed arrives.
fn one_at_a_time(records: &[ChangeRecord], policy: ResurrectionPolicy) -> Snapshot {
    let mut store = EntityStore::new(policy);
    let mut reconciler = Reconciler::new();
    for record in records {
        reconciler.enqueue([record.clone()]);
        reconciler.drain_into(&mut store);
    }
    store.snapshot()
}

/// Buffer everything, then drain once, the way a catch-up fetch arrives.
fn batched(records: &[ChangeRecord], policy: ResurrectionPolicy) -> Snapshot {
    let mut store = EntityStore::new(policy);
    let mut reconciler = Reconciler::new();
    reconciler.enqueue(records.iter().cloned());
    reconciler.drain_into(&mut store);
    store.snapshot()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_delivery_order_does_not_matter((records, first, second) in scenario()) {
        for policy in POLICIES {
            let expected = EntityStore::from_records(&records, policy).snapshot();
            prop_assert_eq!(&one_at_a_time(&first, policy), &expected);
            prop_assert_eq!(&one_at_a_time(&second, policy), &expected);
            prop_assert_eq!(&batched(&second, policy), &expected);
        }
    }

    #[test]
    fn prop_replaying_everything_changes_nothing((records, first, _second) in scenario()) {
        for policy in POLICIES {
            let mut store = EntityStore::new(policy);
            let mut reconciler = Reconciler::new();
            reconciler.enqueue(first.iter().cloned());
            reconciler.drain_into(&mut store);
            let before = store.snapshot();

            reconciler.enqueue(records.iter().cloned());
            let outcome = reconciler.drain_into(&mut store);
            prop_assert_eq!(outcome.applied, 0);
            prop_assert_eq!(store.snapshot(), before);
        }
    }
}
