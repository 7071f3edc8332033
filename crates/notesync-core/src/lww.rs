//! Field-level last-writer-wins rules.
//!
//! Both the entity store and the remote document cache fold writes through
//! these functions, so a document pushed to the mirror always holds exactly
//! what the store would compute from the same writes. Every rule here is
//! commutative: the winner of a field never depends on arrival order.

use crate::model::{ChangeRecord, Field, FieldValue, Stamp, UNSORTED_FOLDER_ID};
use serde::{Deserialize, Serialize};

/// What happens when a tombstoned entity receives a later non-delete edit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResurrectionPolicy {
    /// Any non-delete edit implicitly writes `deleted = false` at its own
    /// stamp: edits newer than the deletion bring the entity back, older
    /// ones do not.
    #[default]
    ResurrectOnEdit,
    /// Once any deletion is seen the entity stays deleted.
    TombstoneWins,
}

/// Expand a record into the writes it performs, including the implicit
/// `deleted = false` of an edit under [`ResurrectionPolicy::ResurrectOnEdit`].
///
/// The built-in Unsorted folder can never be deleted, so writes to its
/// `deleted` field are dropped.
pub fn writes(record: &ChangeRecord, policy: ResurrectionPolicy) -> Vec<(Field, FieldValue)> {
    let mut writes: Vec<(Field, FieldValue)> = record
        .fields_changed
        .iter()
        .map(|(field, value)| (*field, value.clone()))
        .collect();

    if policy == ResurrectionPolicy::ResurrectOnEdit
        && !record.fields_changed.contains_key(&Field::Deleted)
    {
        writes.push((Field::Deleted, FieldValue::Flag(false)));
    }

    if record.entity_id == UNSORTED_FOLDER_ID {
        writes.retain(|(field, _)| *field != Field::Deleted);
    }
    writes
}

/// Whether a write `(value, stamp)` replaces the current `(current, current_stamp)`.
///
/// A write never replaces itself, which makes replays no-ops. On `deleted`,
/// a deletion beats the implicit undelete carried by a partial delivery of
/// the same write.
pub fn supersedes(
    field: Field,
    value: &FieldValue,
    stamp: Stamp,
    current: &FieldValue,
    current_stamp: Stamp,
    policy: ResurrectionPolicy,
) -> bool {
    if field != Field::Deleted {
        return stamp > current_stamp;
    }

    let new_flag = value.as_flag().unwrap_or(false);
    let cur_flag = current.as_flag().unwrap_or(false);
    match policy {
        ResurrectionPolicy::TombstoneWins => match (new_flag, cur_flag) {
            (true, false) => true,
            (false, true) => false,
            _ => stamp > current_stamp,
        },
        // A deletion wins ties on the clock value regardless of device order
        ResurrectionPolicy::ResurrectOnEdit => {
            (stamp.at, new_flag, stamp.origin) > (current_stamp.at, cur_flag, current_stamp.origin)
        }
    }
}
