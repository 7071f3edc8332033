//! EntityStore: the authoritative local copy of the folder/note tree.
//!
//! Each entity is a set of last-writer-wins registers, one per field. The
//! store only changes through [`EntityStore::apply`], so its state is always
//! the fold of every record it has been given, regardless of the order they
//! arrived in.
//!
//! Notes keep the folder id they were written with. If that folder is missing
//! or tombstoned the note is *shown* under the built-in Unsorted folder (its
//! effective parent) without rewriting the stored value, so a folder that
//! arrives late or is resurrected gets its notes back.

use crate::clock::Timestamp;
use crate::fs::{self, FileSystem};
use crate::lww::{self, ResurrectionPolicy};
use crate::model::{
    ChangeRecord, Entity, EntityKind, EntityRef, Field, FieldValue, Folder, Note, Stamp,
    UNSORTED_FOLDER_ID, UNSORTED_FOLDER_NAME,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Durable copy of the store, as the minimal records reproducing it.
pub const ENTITIES_PATH: &str = ".sync/entities.json";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(Uuid),

    #[error("Note {note} references missing or deleted folder {folder}")]
    InvalidReference { note: Uuid, folder: Uuid },

    #[error("Entity {id} is a {found}, not a {expected}")]
    KindMismatch {
        id: Uuid,
        expected: EntityKind,
        found: EntityKind,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Current value of one field and the stamp of the write that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub value: FieldValue,
    pub stamp: Stamp,
}

/// Raw register state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub kind: EntityKind,
    pub registers: BTreeMap<Field, Register>,
}

impl EntityState {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            registers: BTreeMap::new(),
        }
    }

    fn write(
        &mut self,
        field: Field,
        value: FieldValue,
        stamp: Stamp,
        policy: ResurrectionPolicy,
    ) -> bool {
        match self.registers.get_mut(&field) {
            None => {
                self.registers.insert(field, Register { value, stamp });
                true
            }
            Some(current) => {
                if lww::supersedes(field, &value, stamp, &current.value, current.stamp, policy) {
                    *current = Register { value, stamp };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flag(Field::Deleted)
    }

    pub fn stamp_of(&self, field: Field) -> Option<Stamp> {
        self.registers.get(&field).map(|r| r.stamp)
    }

    fn text(&self, field: Field) -> String {
        self.registers
            .get(&field)
            .and_then(|r| r.value.as_text())
            .unwrap_or_default()
            .to_string()
    }

    fn flag(&self, field: Field) -> bool {
        self.registers
            .get(&field)
            .and_then(|r| r.value.as_flag())
            .unwrap_or(false)
    }

    /// Folder id as written, before effective-parent resolution.
    pub fn raw_folder_id(&self) -> Option<Uuid> {
        match self.registers.get(&Field::FolderId).map(|r| &r.value) {
            Some(FieldValue::Id(id)) => Some(*id),
            _ => None,
        }
    }

    fn latest_write(&self) -> Timestamp {
        self.registers
            .values()
            .map(|r| r.stamp.at)
            .max()
            .unwrap_or(Timestamp::ZERO)
    }
}

/// A tombstoned entity and the stamp of its winning deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub id: Uuid,
    pub kind: EntityKind,
    pub deleted_at: Stamp,
}

/// Full materialized state, tombstones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub folders: Vec<Folder>,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone)]
enum Change {
    Added(Entity),
    Updated(Entity),
    Removed(EntityRef),
}

/// UI-visible changes produced by one or more applies.
///
/// Tombstoned entities are not visible: a deletion shows up in `removed`,
/// a resurrection in `added`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreDelta {
    pub added: Vec<Entity>,
    pub updated: Vec<Entity>,
    pub removed: Vec<EntityRef>,
}

impl StoreDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    fn push(&mut self, before: Option<Entity>, after: Option<Entity>) {
        match (before, after) {
            (None, Some(entity)) => self.added.push(entity),
            (Some(entity), None) => self.removed.push(EntityRef {
                id: entity.id(),
                kind: entity.kind(),
            }),
            (Some(old), Some(new)) if old != new => self.updated.push(new),
            _ => {}
        }
    }

    fn into_changes(self) -> BTreeMap<Uuid, Change> {
        let mut changes = BTreeMap::new();
        for e in self.added {
            changes.insert(e.id(), Change::Added(e));
        }
        for e in self.updated {
            changes.insert(e.id(), Change::Updated(e));
        }
        for r in self.removed {
            changes.insert(r.id, Change::Removed(r));
        }
        changes
    }

    /// Fold a later delta into this one, as if both had been applied at once.
    pub fn absorb(&mut self, later: StoreDelta) {
        let mut changes = std::mem::take(self).into_changes();
        for (id, change) in later.into_changes() {
            let merged = match (changes.remove(&id), change) {
                (Some(Change::Removed(_)), Change::Added(e)) => Some(Change::Updated(e)),
                (Some(Change::Added(_)), Change::Updated(e)) => Some(Change::Added(e)),
                (Some(Change::Added(_)), Change::Removed(_)) => None,
                (_, change) => Some(change),
            };
            if let Some(change) = merged {
                changes.insert(id, change);
            }
        }
        for change in changes.into_values() {
            match change {
                Change::Added(e) => self.added.push(e),
                Change::Updated(e) => self.updated.push(e),
                Change::Removed(r) => self.removed.push(r),
            }
        }
    }
}

/// The authoritative local entity tree.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: BTreeMap<Uuid, EntityState>,
    policy: ResurrectionPolicy,
}

impl EntityStore {
    pub fn new(policy: ResurrectionPolicy) -> Self {
        Self {
            entities: BTreeMap::new(),
            policy,
        }
    }

    /// Build a store by folding `records` in stamp order, starting from empty.
    pub fn from_records<'a, I>(records: I, policy: ResurrectionPolicy) -> Self
    where
        I: IntoIterator<Item = &'a ChangeRecord>,
    {
        let mut sorted: Vec<&ChangeRecord> = records.into_iter().collect();
        sorted.sort_by_key(|r| (r.stamp(), r.entity_id));

        let mut store = Self::new(policy);
        for record in sorted {
            store.apply_tracked(record);
        }
        store
    }

    /// Load the persisted store. A missing file is an empty store.
    pub async fn load<F: FileSystem + ?Sized>(
        fs: &F,
        policy: ResurrectionPolicy,
    ) -> fs::Result<Self> {
        let records: Vec<ChangeRecord> = fs::read_json(fs, ENTITIES_PATH).await?.unwrap_or_default();
        Ok(Self::from_records(&records, policy))
    }

    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F) -> fs::Result<()> {
        fs::write_json(fs, ENTITIES_PATH, &self.all_records()).await
    }

    pub fn policy(&self) -> ResurrectionPolicy {
        self.policy
    }

    /// Apply one record. Total and idempotent: invalid records are logged
    /// and ignored, replays change nothing.
    pub fn apply(&mut self, record: &ChangeRecord) -> StoreDelta {
        self.apply_tracked(record).1
    }

    /// Like [`apply`](Self::apply), also reporting whether any register changed
    /// (a change to a tombstoned entity can alter state without a visible delta).
    pub fn apply_tracked(&mut self, record: &ChangeRecord) -> (bool, StoreDelta) {
        if let Err(e) = record.validate() {
            warn!(entity = %record.entity_id, "Ignoring invalid record: {}", e);
            return (false, StoreDelta::default());
        }
        if let Some(existing) = self.entities.get(&record.entity_id) {
            if existing.kind != record.entity_kind {
                let err = StoreError::KindMismatch {
                    id: record.entity_id,
                    expected: existing.kind,
                    found: record.entity_kind,
                };
                warn!("Ignoring record: {}", err);
                return (false, StoreDelta::default());
            }
        }

        let affected = self.affected_by(record);
        let before: Vec<Option<Entity>> = affected.iter().map(|id| self.visible(*id)).collect();

        if !self.merge(record) {
            return (false, StoreDelta::default());
        }

        let mut delta = StoreDelta::default();
        for (id, before) in affected.iter().zip(before) {
            delta.push(before, self.visible(*id));
        }
        if record.entity_kind == EntityKind::Note {
            self.check_reference(record.entity_id);
        }
        (true, delta)
    }

    fn merge(&mut self, record: &ChangeRecord) -> bool {
        let writes = lww::writes(record, self.policy);
        if writes.is_empty() {
            return false;
        }
        let stamp = record.stamp();
        let policy = self.policy;
        let state = self
            .entities
            .entry(record.entity_id)
            .or_insert_with(|| EntityState::new(record.entity_kind));

        let mut changed = false;
        for (field, value) in writes {
            changed |= state.write(field, value, stamp, policy);
        }
        changed
    }

    /// The entity itself, plus every note stored under it when it is a folder
    /// (their effective parent may flip).
    fn affected_by(&self, record: &ChangeRecord) -> Vec<Uuid> {
        let mut ids = vec![record.entity_id];
        if record.entity_kind == EntityKind::Folder {
            ids.extend(
                self.entities
                    .iter()
                    .filter(|(_, s)| {
                        s.kind == EntityKind::Note && s.raw_folder_id() == Some(record.entity_id)
                    })
                    .map(|(id, _)| *id),
            );
        }
        ids
    }

    fn check_reference(&self, note_id: Uuid) {
        let Some(state) = self.entities.get(&note_id) else {
            return;
        };
        if state.is_deleted() {
            return;
        }
        match state.raw_folder_id() {
            Some(folder) if self.effective_folder(folder) != folder => {
                let err = StoreError::InvalidReference {
                    note: note_id,
                    folder,
                };
                warn!("{}; showing it under {}", err, UNSORTED_FOLDER_NAME);
            }
            None => debug!(note = %note_id, "Note has no folder yet; showing it under Unsorted"),
            _ => {}
        }
    }

    /// Folder a note stored under `folder` is displayed in.
    pub fn effective_folder(&self, folder: Uuid) -> Uuid {
        if folder == UNSORTED_FOLDER_ID {
            return folder;
        }
        match self.entities.get(&folder) {
            Some(state) if state.kind == EntityKind::Folder && !state.is_deleted() => folder,
            _ => UNSORTED_FOLDER_ID,
        }
    }

    fn materialize(&self, id: Uuid) -> Option<Entity> {
        match self.entities.get(&id) {
            Some(state) => Some(match state.kind {
                EntityKind::Folder => Entity::Folder(self.folder_from(id, Some(state))),
                EntityKind::Note => Entity::Note(self.note_from(id, state)),
            }),
            None if id == UNSORTED_FOLDER_ID => Some(Entity::Folder(self.folder_from(id, None))),
            None => None,
        }
    }

    fn visible(&self, id: Uuid) -> Option<Entity> {
        self.materialize(id).filter(|e| !e.is_deleted())
    }

    fn folder_from(&self, id: Uuid, state: Option<&EntityState>) -> Folder {
        let name = state.map(|s| s.text(Field::Name)).unwrap_or_default();
        let name = if name.is_empty() && id == UNSORTED_FOLDER_ID {
            UNSORTED_FOLDER_NAME.to_string()
        } else {
            name
        };
        let created_at = match state.and_then(|s| s.registers.get(&Field::CreatedAt)) {
            Some(Register {
                value: FieldValue::Time(t),
                ..
            }) => *t,
            _ => Timestamp::ZERO,
        };
        let order_hint = match state.and_then(|s| s.registers.get(&Field::OrderHint)) {
            Some(Register {
                value: FieldValue::Number(n),
                ..
            }) => *n,
            _ if id == UNSORTED_FOLDER_ID => f64::MAX,
            _ => 0.0,
        };
        Folder {
            id,
            name,
            created_at,
            order_hint,
            deleted: state.map(|s| s.is_deleted()).unwrap_or(false),
        }
    }

    fn note_from(&self, id: Uuid, state: &EntityState) -> Note {
        let folder_id = state
            .raw_folder_id()
            .map(|f| self.effective_folder(f))
            .unwrap_or(UNSORTED_FOLDER_ID);
        let tags = match state.registers.get(&Field::Tags) {
            Some(Register {
                value: FieldValue::Tags(tags),
                ..
            }) => tags.clone(),
            _ => BTreeSet::new(),
        };
        Note {
            id,
            folder_id,
            title: state.text(Field::Title),
            body: state.text(Field::Body),
            tags,
            updated_at: state.latest_write(),
            deleted: state.is_deleted(),
        }
    }

    /// Look up an entity, tombstoned or not.
    pub fn get(&self, id: Uuid) -> Result<Entity> {
        self.materialize(id).ok_or(StoreError::NotFound(id))
    }

    pub fn get_note(&self, id: Uuid) -> Result<Note> {
        match self.get(id)? {
            Entity::Note(note) => Ok(note),
            other => Err(StoreError::KindMismatch {
                id,
                expected: EntityKind::Note,
                found: other.kind(),
            }),
        }
    }

    pub fn get_folder(&self, id: Uuid) -> Result<Folder> {
        match self.get(id)? {
            Entity::Folder(folder) => Ok(folder),
            other => Err(StoreError::KindMismatch {
                id,
                expected: EntityKind::Folder,
                found: other.kind(),
            }),
        }
    }

    /// Whether notes can currently be filed under `id`.
    pub fn folder_is_live(&self, id: Uuid) -> bool {
        self.effective_folder(id) == id
    }

    /// Every folder and note, tombstones included, ordered by id.
    pub fn snapshot(&self) -> Snapshot {
        let mut folders = Vec::new();
        let mut notes = Vec::new();
        if !self.entities.contains_key(&UNSORTED_FOLDER_ID) {
            folders.push(self.folder_from(UNSORTED_FOLDER_ID, None));
        }
        for (id, state) in &self.entities {
            match state.kind {
                EntityKind::Folder => folders.push(self.folder_from(*id, Some(state))),
                EntityKind::Note => notes.push(self.note_from(*id, state)),
            }
        }
        folders.sort_by_key(|f| f.id);
        Snapshot { folders, notes }
    }

    /// Live folders in display order.
    pub fn folders(&self) -> Vec<Folder> {
        let mut folders: Vec<Folder> = self
            .snapshot()
            .folders
            .into_iter()
            .filter(|f| !f.deleted)
            .collect();
        folders.sort_by(|a, b| {
            a.order_hint
                .total_cmp(&b.order_hint)
                .then_with(|| a.name.cmp(&b.name))
        });
        folders
    }

    /// Live notes displayed under `folder`.
    pub fn notes_in(&self, folder: Uuid) -> Vec<Note> {
        self.entities
            .iter()
            .filter(|(_, s)| s.kind == EntityKind::Note && !s.is_deleted())
            .map(|(id, s)| self.note_from(*id, s))
            .filter(|n| n.folder_id == folder)
            .collect()
    }

    pub fn entity_state(&self, id: Uuid) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn entity_states(&self) -> impl Iterator<Item = (&Uuid, &EntityState)> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Minimal records reproducing the current state of one entity: one
    /// record per distinct winning stamp.
    pub fn records_for(&self, id: Uuid) -> Vec<ChangeRecord> {
        let Some(state) = self.entities.get(&id) else {
            return Vec::new();
        };
        let mut by_stamp: BTreeMap<Stamp, BTreeMap<Field, FieldValue>> = BTreeMap::new();
        for (field, register) in &state.registers {
            by_stamp
                .entry(register.stamp)
                .or_default()
                .insert(*field, register.value.clone());
        }
        by_stamp
            .into_iter()
            .map(|(stamp, fields_changed)| ChangeRecord {
                entity_id: id,
                entity_kind: state.kind,
                fields_changed,
                timestamp: stamp.at,
                origin_device: stamp.origin,
            })
            .collect()
    }

    /// Records reproducing the whole store, in stamp order.
    pub fn all_records(&self) -> Vec<ChangeRecord> {
        let mut records: Vec<ChangeRecord> =
            self.entities.keys().flat_map(|id| self.records_for(*id)).collect();
        records.sort_by_key(|r| (r.stamp(), r.entity_id));
        records
    }

    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.entities
            .iter()
            .filter(|(_, s)| s.is_deleted())
            .filter_map(|(id, s)| {
                s.stamp_of(Field::Deleted).map(|deleted_at| Tombstone {
                    id: *id,
                    kind: s.kind,
                    deleted_at,
                })
            })
            .collect()
    }

    /// Physically remove an entity. Used by compaction only.
    pub fn purge(&mut self, id: Uuid) -> StoreDelta {
        if id == UNSORTED_FOLDER_ID {
            return StoreDelta::default();
        }
        let before = self.visible(id);
        let mut delta = StoreDelta::default();
        if self.entities.remove(&id).is_some() {
            delta.push(before, None);
        }
        delta
    }

    /// Visible differences between two stores, used after a wholesale replace.
    pub fn diff(before: &EntityStore, after: &EntityStore) -> StoreDelta {
        let ids: BTreeSet<Uuid> = before
            .entities
            .keys()
            .chain(after.entities.keys())
            .copied()
            .chain(std::iter::once(UNSORTED_FOLDER_ID))
            .collect();
        let mut delta = StoreDelta::default();
        for id in ids {
            delta.push(before.visible(id), after.visible(id));
        }
        delta
    }
}
