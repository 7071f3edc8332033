//! Backup codec: portable JSON export and wholesale import of the entity tree.
//!
//! ```json
//! { "formatVersion": 1, "exportedAt": 1700000000000,
//!   "folders": [ { "id": "…", "name": "Work", "createdAt": {…}, "orderHint": 1.0,
//!                  "deleted": false, "revisions": { "name": {…} } } ],
//!   "notes":   [ { "id": "…", "folderId": "…", "title": "…", "body": "…",
//!                  "tags": ["a"], "updatedAt": {…}, "deleted": false } ] }
//! ```
//!
//! `revisions` records the stamp of every written field so an import
//! reproduces the exact merge state. Documents written by hand may omit it;
//! their fields are then stamped by the importing device.

use crate::clock::Timestamp;
use crate::lww::ResurrectionPolicy;
use crate::model::{
    ChangeRecord, EntityKind, Field, FieldValue, Stamp, UNSORTED_FOLDER_ID,
};
use crate::store::{EntityState, EntityStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Newest format this build reads and the one it writes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackupError {
    #[error("Unsupported backup format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    #[error("Malformed backup document: {0}")]
    MalformedDocument(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

type Revisions = BTreeMap<Field, Stamp>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFolder {
    pub id: Uuid,
    pub name: String,
    pub created_at: Timestamp,
    pub order_hint: f64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<Revisions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupNote {
    pub id: Uuid,
    /// Folder as stored, which may differ from the folder the note is shown in
    pub folder_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<Revisions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub format_version: u32,
    /// Wall-clock milliseconds at export
    pub exported_at: u64,
    pub folders: Vec<BackupFolder>,
    pub notes: Vec<BackupNote>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub include_tombstones: bool,
    pub include_revisions: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_tombstones: true,
            include_revisions: true,
        }
    }
}

fn revisions_of(state: &EntityState) -> Revisions {
    state
        .registers
        .iter()
        .map(|(field, register)| (*field, register.stamp))
        .collect()
}

/// Full snapshot of `store`, tombstones and field stamps included.
pub fn export(store: &EntityStore, exported_at: u64) -> BackupDocument {
    export_with(store, exported_at, ExportOptions::default())
}

pub fn export_with(store: &EntityStore, exported_at: u64, options: ExportOptions) -> BackupDocument {
    let snapshot = store.snapshot();
    let revisions = |id: Uuid| {
        if options.include_revisions {
            store.entity_state(id).map(revisions_of)
        } else {
            None
        }
    };

    let folders = snapshot
        .folders
        .into_iter()
        // The built-in folder only travels once someone has changed it
        .filter(|f| f.id != UNSORTED_FOLDER_ID || store.entity_state(f.id).is_some())
        .filter(|f| options.include_tombstones || !f.deleted)
        .map(|f| BackupFolder {
            revisions: revisions(f.id),
            id: f.id,
            name: f.name,
            created_at: f.created_at,
            order_hint: f.order_hint,
            deleted: f.deleted,
        })
        .collect();

    let notes = snapshot
        .notes
        .into_iter()
        .filter(|n| options.include_tombstones || !n.deleted)
        .map(|n| BackupNote {
            revisions: revisions(n.id),
            folder_id: store
                .entity_state(n.id)
                .and_then(|s| s.raw_folder_id())
                .unwrap_or(n.folder_id),
            id: n.id,
            title: n.title,
            body: n.body,
            tags: n.tags,
            updated_at: n.updated_at,
            deleted: n.deleted,
        })
        .collect();

    BackupDocument {
        format_version: FORMAT_VERSION,
        exported_at,
        folders,
        notes,
    }
}

impl BackupDocument {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BackupError::MalformedDocument(e.to_string()))
    }

    /// Parse backup text. The version is checked before the body so that a
    /// newer format is reported as such, not as malformed.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| BackupError::MalformedDocument(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let version = value
            .get("formatVersion")
            .ok_or_else(|| BackupError::MalformedDocument("missing formatVersion".into()))?
            .as_u64()
            .ok_or_else(|| {
                BackupError::MalformedDocument("formatVersion must be a non-negative integer".into())
            })?;
        if version == 0 || version > u64::from(FORMAT_VERSION) {
            return Err(BackupError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let doc: BackupDocument = serde_json::from_value(value)
            .map_err(|e| BackupError::MalformedDocument(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let all_ids = self
            .folders
            .iter()
            .map(|f| f.id)
            .chain(self.notes.iter().map(|n| n.id));
        for id in all_ids {
            if !ids.insert(id) {
                return Err(BackupError::MalformedDocument(format!("duplicate id {}", id)));
            }
        }
        if self.folders.iter().any(|f| !f.order_hint.is_finite()) {
            return Err(BackupError::MalformedDocument("orderHint must be finite".into()));
        }

        let folder_ids: HashSet<Uuid> = self.folders.iter().map(|f| f.id).collect();
        for note in &self.notes {
            if note.folder_id != UNSORTED_FOLDER_ID && !folder_ids.contains(&note.folder_id) {
                warn!(
                    note = %note.id,
                    folder = %note.folder_id,
                    "Backup note references a folder that is not in the backup"
                );
            }
        }
        Ok(())
    }
}

fn records_for(
    id: Uuid,
    kind: EntityKind,
    fields: Vec<(Field, FieldValue)>,
    revisions: Option<&Revisions>,
    fallback: Stamp,
) -> Vec<ChangeRecord> {
    let mut by_stamp: BTreeMap<Stamp, BTreeMap<Field, FieldValue>> = BTreeMap::new();
    for (field, value) in fields {
        let stamp = match revisions {
            // Fields the exporting store never wrote stay unwritten
            Some(revisions) => match revisions.get(&field) {
                Some(stamp) => *stamp,
                None => continue,
            },
            None => fallback,
        };
        by_stamp.entry(stamp).or_default().insert(field, value);
    }
    by_stamp
        .into_iter()
        .map(|(stamp, fields_changed)| ChangeRecord {
            entity_id: id,
            entity_kind: kind,
            fields_changed,
            timestamp: stamp.at,
            origin_device: stamp.origin,
        })
        .collect()
}

/// The records an import seeds, in stamp order. Entities exported without
/// revisions have every field written at `stamp`.
pub fn import_records(doc: &BackupDocument, stamp: Stamp) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    for folder in &doc.folders {
        let fields = vec![
            (Field::Name, FieldValue::Text(folder.name.clone())),
            (Field::CreatedAt, FieldValue::Time(folder.created_at)),
            (Field::OrderHint, FieldValue::Number(folder.order_hint)),
            (Field::Deleted, FieldValue::Flag(folder.deleted)),
        ];
        records.extend(records_for(
            folder.id,
            EntityKind::Folder,
            fields,
            folder.revisions.as_ref(),
            stamp,
        ));
    }
    for note in &doc.notes {
        let fields = vec![
            (Field::FolderId, FieldValue::Id(note.folder_id)),
            (Field::Title, FieldValue::Text(note.title.clone())),
            (Field::Body, FieldValue::Text(note.body.clone())),
            (Field::Tags, FieldValue::Tags(note.tags.clone())),
            (Field::Deleted, FieldValue::Flag(note.deleted)),
        ];
        records.extend(records_for(
            note.id,
            EntityKind::Note,
            fields,
            note.revisions.as_ref(),
            stamp,
        ));
    }
    records.sort_by_key(|r| (r.stamp(), r.entity_id));
    records
}

/// Build a fresh store from a backup. The caller swaps it in; nothing is
/// touched if this fails.
pub fn import(
    doc: &BackupDocument,
    stamp: Stamp,
    policy: ResurrectionPolicy,
) -> Result<EntityStore> {
    let records = import_records(doc, stamp);
    let mut store = EntityStore::new(policy);
    for record in &records {
        record
            .validate()
            .map_err(|e| BackupError::MalformedDocument(e.to_string()))?;
        store.apply(record);
    }
    info!(
        folders = doc.folders.len(),
        notes = doc.notes.len(),
        "Imported backup"
    );
    Ok(store)
}
