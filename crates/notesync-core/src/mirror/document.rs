//! Remote document shape: one JSON document per entity.
//!
//! Each field carries the stamp of the write that produced it, so any device
//! can merge a document with the same rules the entity store uses:
//!
//! ```json
//! {
//!   "id": "…",
//!   "kind": "note",
//!   "fields": {
//!     "title": { "value": { "type": "text", "value": "Draft" },
//!                "at": { "wallMs": 1700000000000, "counter": 0 },
//!                "origin": "00000000000000a1" }
//!   }
//! }
//! ```
//!
//! Documents come from a store nobody controls, so [`RemoteDocument::from_json`]
//! checks every field against the entity kind before anything is merged.

use super::MirrorError;
use crate::DeviceId;
use crate::clock::Timestamp;
use crate::lww::{self, ResurrectionPolicy};
use crate::model::{ChangeRecord, EntityKind, Field, FieldValue, Stamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteField {
    pub value: FieldValue,
    pub at: Timestamp,
    pub origin: DeviceId,
}

impl RemoteField {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.at, self.origin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: Uuid,
    pub kind: EntityKind,
    pub fields: BTreeMap<Field, RemoteField>,
}

impl RemoteDocument {
    pub fn new(id: Uuid, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            fields: BTreeMap::new(),
        }
    }

    /// Fold `records` into a fresh document.
    pub fn from_records<'a, I>(id: Uuid, kind: EntityKind, records: I, policy: ResurrectionPolicy) -> Self
    where
        I: IntoIterator<Item = &'a ChangeRecord>,
    {
        let mut doc = Self::new(id, kind);
        for record in records {
            doc.merge_record(record, policy);
        }
        doc
    }

    /// Decode and validate a raw document.
    pub fn from_json(value: Value) -> Result<Self, MirrorError> {
        let doc: RemoteDocument =
            serde_json::from_value(value).map_err(|e| MirrorError::Malformed(e.to_string()))?;
        if doc.fields.is_empty() {
            return Err(MirrorError::Malformed(format!("document {} has no fields", doc.id)));
        }
        for record in doc.to_records() {
            record
                .validate()
                .map_err(|e| MirrorError::Malformed(format!("document {}: {}", doc.id, e)))?;
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Value, MirrorError> {
        serde_json::to_value(self).map_err(|e| MirrorError::Malformed(e.to_string()))
    }

    /// Merge one record with field-level last-writer-wins. Returns true if
    /// any field changed. Records for other entities are ignored.
    pub fn merge_record(&mut self, record: &ChangeRecord, policy: ResurrectionPolicy) -> bool {
        if record.entity_id != self.id || record.entity_kind != self.kind {
            return false;
        }
        let stamp = record.stamp();
        let mut changed = false;
        for (field, value) in lww::writes(record, policy) {
            let replace = match self.fields.get(&field) {
                None => true,
                Some(current) => {
                    lww::supersedes(field, &value, stamp, &current.value, current.stamp(), policy)
                }
            };
            if replace {
                self.fields.insert(
                    field,
                    RemoteField {
                        value,
                        at: stamp.at,
                        origin: stamp.origin,
                    },
                );
                changed = true;
            }
        }
        changed
    }

    /// Records reproducing this document, one per distinct stamp.
    pub fn to_records(&self) -> Vec<ChangeRecord> {
        let mut by_stamp: BTreeMap<Stamp, BTreeMap<Field, FieldValue>> = BTreeMap::new();
        for (field, remote) in &self.fields {
            by_stamp
                .entry(remote.stamp())
                .or_default()
                .insert(*field, remote.value.clone());
        }
        by_stamp
            .into_iter()
            .map(|(stamp, fields_changed)| ChangeRecord {
                entity_id: self.id,
                entity_kind: self.kind,
                fields_changed,
                timestamp: stamp.at,
                origin_device: stamp.origin,
            })
            .collect()
    }

    pub fn latest_stamp(&self) -> Option<Stamp> {
        self.fields.values().map(RemoteField::stamp).max()
    }
}
