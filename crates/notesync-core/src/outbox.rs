//! Entities waiting to be pushed.
//!
//! Tracked per entity rather than per record: a flush pushes the entity's
//! whole current state, so a newer local edit simply supersedes the queued one.

use crate::model::Stamp;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct Outbox {
    pending: BTreeMap<Uuid, Stamp>,
    coalesced: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id` for pushing. Returns true if it replaced a queued change.
    pub fn enqueue(&mut self, id: Uuid, stamp: Stamp) -> bool {
        match self.pending.get_mut(&id) {
            Some(queued) => {
                *queued = (*queued).max(stamp);
                self.coalesced += 1;
                true
            }
            None => {
                self.pending.insert(id, stamp);
                false
            }
        }
    }

    /// Take everything queued.
    pub fn take(&mut self) -> BTreeMap<Uuid, Stamp> {
        std::mem::take(&mut self.pending)
    }

    /// Put back entries from a failed flush, keeping anything queued since.
    pub fn restore(&mut self, taken: BTreeMap<Uuid, Stamp>) {
        for (id, stamp) in taken {
            self.pending
                .entry(id)
                .and_modify(|queued| *queued = (*queued).max(stamp))
                .or_insert(stamp);
        }
    }

    pub fn remove(&mut self, id: Uuid) {
        self.pending.remove(&id);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued changes superseded by a newer one before being pushed.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceId;
    use crate::clock::Timestamp;

    fn stamp(wall: u64) -> Stamp {
        Stamp::new(Timestamp::new(wall, 0), DeviceId::from(1))
    }

    #[test]
    fn test_newer_edit_coalesces() {
        let mut outbox = Outbox::new();
        let id = Uuid::new_v4();
        assert!(!outbox.enqueue(id, stamp(1)));
        assert!(outbox.enqueue(id, stamp(2)));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.coalesced(), 1);
        assert_eq!(outbox.take()[&id], stamp(2));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_restore_keeps_newer_entries() {
        let mut outbox = Outbox::new();
        let id = Uuid::new_v4();
        outbox.enqueue(id, stamp(1));
        let taken = outbox.take();
        outbox.enqueue(id, stamp(5));
        outbox.restore(taken);
        assert_eq!(outbox.take()[&id], stamp(5));
    }
}
