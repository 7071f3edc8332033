//! Reconciliation: folds incoming remote records into the entity store.
//!
//! Records are buffered and drained in `(timestamp, origin, entity)` order,
//! so one entity's records are always applied in increasing stamp order
//! within a batch. A record older than one already applied for its entity
//! (a late delivery) is still applied: the field registers decide whether it
//! wins, so the outcome never depends on arrival order.
//!
//! Also decides which tombstones are safe to compact.

use crate::DeviceId;
use crate::devices::KnownDevices;
use crate::model::{ChangeRecord, Stamp};
use crate::store::{EntityStore, StoreDelta, Tombstone};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

/// Summary of one drain of the reorder buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Records that changed at least one register
    pub applied: usize,
    /// Records that changed nothing (replays, losing writes)
    pub unchanged: usize,
    /// Records older than one already applied for the same entity
    pub late: usize,
    /// Entities touched by this drain
    pub entities: BTreeSet<Uuid>,
    pub delta: StoreDelta,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    buffer: BTreeMap<(Stamp, Uuid), ChangeRecord>,
    last_applied: HashMap<Uuid, Stamp>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer records for the next drain. The same write delivered twice is
    /// buffered once.
    pub fn enqueue<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        for record in records {
            let key = (record.stamp(), record.entity_id);
            match self.buffer.get_mut(&key) {
                Some(existing) => {
                    for (field, value) in record.fields_changed {
                        existing.fields_changed.entry(field).or_insert(value);
                    }
                }
                None => {
                    self.buffer.insert(key, record);
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Apply every buffered record in stamp order.
    pub fn drain_into(&mut self, store: &mut EntityStore) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for ((stamp, id), record) in std::mem::take(&mut self.buffer) {
            let last = self.last_applied.entry(id).or_insert(stamp);
            if stamp < *last {
                outcome.late += 1;
                debug!(entity = %id, stamp = %stamp, last = %last, "Late record");
            } else {
                *last = stamp;
            }

            let (changed, delta) = store.apply_tracked(&record);
            if changed {
                outcome.applied += 1;
            } else {
                outcome.unchanged += 1;
            }
            outcome.entities.insert(id);
            outcome.delta.absorb(delta);
        }
        outcome
    }

    /// Forget an entity after compaction.
    pub fn forget(&mut self, id: Uuid) {
        self.last_applied.remove(&id);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_applied.clear();
    }
}

/// Windows governing tombstone compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionWindows {
    pub retention_ms: u64,
    pub fallback_ms: u64,
}

/// Tombstones old enough to remove physically.
///
/// A tombstone qualifies once it is older than the retention window, its
/// deletion has been acknowledged by the mirror and every known device has
/// moved past it. Past the fallback window it qualifies unconditionally.
pub fn compactable<C>(
    store: &EntityStore,
    devices: &KnownDevices,
    is_confirmed: C,
    local: DeviceId,
    now_ms: u64,
    windows: CompactionWindows,
) -> Vec<Tombstone>
where
    C: Fn(Uuid) -> bool,
{
    store
        .tombstones()
        .into_iter()
        .filter(|t| {
            let age = now_ms.saturating_sub(t.deleted_at.at.wall_ms);
            if age >= windows.fallback_ms {
                return true;
            }
            age >= windows.retention_ms
                && is_confirmed(t.id)
                && devices.all_observed(t.deleted_at, local)
        })
        .collect()
}
