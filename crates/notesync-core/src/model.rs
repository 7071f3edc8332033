//! Entities, change records and the UI mutation intents that produce them.

use crate::clock::Timestamp;
use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Well-known id of the built-in "Unsorted" folder, identical on every device.
pub const UNSORTED_FOLDER_ID: Uuid = Uuid::from_u128(0x6e6f_7465_7379_6e63_8000_0000_0000_0001);

/// Display name of the built-in folder until someone renames it.
pub const UNSORTED_FOLDER_NAME: &str = "Unsorted";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("record for {0} changes no fields")]
    EmptyRecord(Uuid),
    #[error("field {field} does not belong to a {kind}")]
    FieldNotAllowed { field: Field, kind: EntityKind },
    #[error("field {field} cannot hold a {found} value")]
    TypeMismatch { field: Field, found: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Folder,
    Note,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Folder => f.write_str("folder"),
            EntityKind::Note => f.write_str("note"),
        }
    }
}

/// A single last-writer-wins field of a folder or note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Name,
    CreatedAt,
    OrderHint,
    FolderId,
    Title,
    Body,
    Tags,
    Deleted,
}

impl Field {
    pub const FOLDER_FIELDS: [Field; 4] = [
        Field::Name,
        Field::CreatedAt,
        Field::OrderHint,
        Field::Deleted,
    ];
    pub const NOTE_FIELDS: [Field; 5] = [
        Field::FolderId,
        Field::Title,
        Field::Body,
        Field::Tags,
        Field::Deleted,
    ];

    pub fn allowed_for(self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Folder => Self::FOLDER_FIELDS.contains(&self),
            EntityKind::Note => Self::NOTE_FIELDS.contains(&self),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::CreatedAt => "createdAt",
            Field::OrderHint => "orderHint",
            Field::FolderId => "folderId",
            Field::Title => "title",
            Field::Body => "body",
            Field::Tags => "tags",
            Field::Deleted => "deleted",
        }
    }

    fn accepts(self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (Field::Name | Field::Title | Field::Body, FieldValue::Text(_))
                | (Field::CreatedAt, FieldValue::Time(_))
                | (Field::OrderHint, FieldValue::Number(_))
                | (Field::FolderId, FieldValue::Id(_))
                | (Field::Tags, FieldValue::Tags(_))
                | (Field::Deleted, FieldValue::Flag(_))
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The new value written to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Id(Uuid),
    Tags(BTreeSet<String>),
    Flag(bool),
    Time(Timestamp),
}

impl FieldValue {
    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Number(_) => "number",
            FieldValue::Id(_) => "id",
            FieldValue::Tags(_) => "tags",
            FieldValue::Flag(_) => "flag",
            FieldValue::Time(_) => "time",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

/// Total order key of a write: `(timestamp, origin device)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Stamp {
    pub at: Timestamp,
    pub origin: DeviceId,
}

impl Stamp {
    pub fn new(at: Timestamp, origin: DeviceId) -> Self {
        Self { at, origin }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.at, self.origin)
    }
}

/// An immutable, stamped change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub entity_id: Uuid,
    pub entity_kind: EntityKind,
    pub fields_changed: BTreeMap<Field, FieldValue>,
    pub timestamp: Timestamp,
    pub origin_device: DeviceId,
}

impl ChangeRecord {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.timestamp, self.origin_device)
    }

    /// Whether this record tombstones its entity.
    pub fn is_deletion(&self) -> bool {
        matches!(
            self.fields_changed.get(&Field::Deleted),
            Some(FieldValue::Flag(true))
        )
    }

    /// Check that every field belongs to the entity kind and carries a value
    /// of the right type.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.fields_changed.is_empty() {
            return Err(ModelError::EmptyRecord(self.entity_id));
        }
        for (field, value) in &self.fields_changed {
            if !field.allowed_for(self.entity_kind) {
                return Err(ModelError::FieldNotAllowed {
                    field: *field,
                    kind: self.entity_kind,
                });
            }
            if !field.accepts(value) {
                return Err(ModelError::TypeMismatch {
                    field: *field,
                    found: value.type_name(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub created_at: Timestamp,
    pub order_hint: f64,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: Uuid,
    pub folder_id: Uuid,
    pub title: String,
    pub body: String,
    pub tags: BTreeSet<String>,
    pub updated_at: Timestamp,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Folder(Folder),
    Note(Note),
}

impl Entity {
    pub fn id(&self) -> Uuid {
        match self {
            Entity::Folder(f) => f.id,
            Entity::Note(n) => n.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Folder(_) => EntityKind::Folder,
            Entity::Note(_) => EntityKind::Note,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Entity::Folder(f) => f.deleted,
            Entity::Note(n) => n.deleted,
        }
    }
}

/// Identifies an entity without carrying its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityRef {
    pub id: Uuid,
    pub kind: EntityKind,
}

/// Partial update of a note. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteEdit {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

impl NoteEdit {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: Some(tags.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.tags.is_none()
    }
}

/// A UI intent, translated 1:1 into a change record by the change log.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateFolder {
        id: Uuid,
        name: String,
        order_hint: f64,
    },
    RenameFolder {
        id: Uuid,
        name: String,
    },
    ReorderFolder {
        id: Uuid,
        order_hint: f64,
    },
    DeleteFolder {
        id: Uuid,
    },
    CreateNote {
        id: Uuid,
        folder_id: Uuid,
        title: String,
        body: String,
        tags: BTreeSet<String>,
    },
    EditNote {
        id: Uuid,
        edit: NoteEdit,
    },
    DeleteNote {
        id: Uuid,
    },
    MoveNote {
        id: Uuid,
        folder_id: Uuid,
    },
}

impl Mutation {
    pub fn entity_id(&self) -> Uuid {
        match self {
            Mutation::CreateFolder { id, .. }
            | Mutation::RenameFolder { id, .. }
            | Mutation::ReorderFolder { id, .. }
            | Mutation::DeleteFolder { id }
            | Mutation::CreateNote { id, .. }
            | Mutation::EditNote { id, .. }
            | Mutation::DeleteNote { id }
            | Mutation::MoveNote { id, .. } => *id,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Mutation::CreateFolder { .. }
            | Mutation::RenameFolder { .. }
            | Mutation::ReorderFolder { .. }
            | Mutation::DeleteFolder { .. } => EntityKind::Folder,
            _ => EntityKind::Note,
        }
    }

    /// Fields written by this intent when stamped at `at`.
    pub fn into_fields(self, at: Timestamp) -> BTreeMap<Field, FieldValue> {
        let mut fields = BTreeMap::new();
        match self {
            Mutation::CreateFolder {
                name, order_hint, ..
            } => {
                fields.insert(Field::Name, FieldValue::Text(name));
                fields.insert(Field::CreatedAt, FieldValue::Time(at));
                fields.insert(Field::OrderHint, FieldValue::Number(order_hint));
                fields.insert(Field::Deleted, FieldValue::Flag(false));
            }
            Mutation::RenameFolder { name, .. } => {
                fields.insert(Field::Name, FieldValue::Text(name));
            }
            Mutation::ReorderFolder { order_hint, .. } => {
                fields.insert(Field::OrderHint, FieldValue::Number(order_hint));
            }
            Mutation::DeleteFolder { .. } | Mutation::DeleteNote { .. } => {
                fields.insert(Field::Deleted, FieldValue::Flag(true));
            }
            Mutation::CreateNote {
                folder_id,
                title,
                body,
                tags,
                ..
            } => {
                fields.insert(Field::FolderId, FieldValue::Id(folder_id));
                fields.insert(Field::Title, FieldValue::Text(title));
                fields.insert(Field::Body, FieldValue::Text(body));
                fields.insert(Field::Tags, FieldValue::Tags(tags));
                fields.insert(Field::Deleted, FieldValue::Flag(false));
            }
            Mutation::EditNote { edit, .. } => {
                if let Some(title) = edit.title {
                    fields.insert(Field::Title, FieldValue::Text(title));
                }
                if let Some(body) = edit.body {
                    fields.insert(Field::Body, FieldValue::Text(body));
                }
                if let Some(tags) = edit.tags {
                    fields.insert(Field::Tags, FieldValue::Tags(tags));
                }
            }
            Mutation::MoveNote { folder_id, .. } => {
                fields.insert(Field::FolderId, FieldValue::Id(folder_id));
            }
        }
        fields
    }
}
