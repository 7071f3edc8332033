//! notesync-core: local-first sync engine for a folders-and-notes organizer.
//!
//! This crate provides:
//! - An entity store with field-level last-writer-wins merging
//! - A durable, HLC-stamped change log
//! - A remote mirror adapter over a generic document store
//! - A reconciliation engine that converges concurrent edits
//! - A versioned JSON backup codec
//! - FileSystem and DocumentStore trait abstractions

pub mod backup;
pub mod change_log;
pub mod clock;
pub mod config;
pub mod context;
pub mod device_id;
pub mod devices;
pub mod engine;
pub mod error;
pub mod events;
pub mod fs;
pub mod lww;
pub mod mirror;
pub mod model;
pub mod outbox;
pub mod reconcile;
pub mod store;
pub mod tagging;

pub use backup::{BackupDocument, BackupError};
pub use change_log::{ChangeLog, LogError};
pub use clock::{
    ClockError, HybridClock, MAX_CLOCK_DRIFT_MS, ManualClock, SystemClock, Timestamp, WallClock,
};
pub use config::{ConfigError, SyncConfig};
pub use context::{SyncContext, SyncKey, SyncKeyError};
pub use device_id::{DeviceId, DeviceIdError};
pub use engine::{CompactionReport, PullReport, SyncEngine};
pub use error::{ErrorClass, Result, SyncError};
pub use events::{EventBus, EventSubscription, SyncEvent, SyncStatus};
pub use fs::{FileEntry, FileSystem, FsError, InMemoryFs};
pub use lww::ResurrectionPolicy;
pub use mirror::{
    DirectoryDocumentStore, DocumentStore, InMemoryDocumentStore, MirrorError, PushOutcome,
    RemoteMirror, RetryPolicy, Subscription,
};
pub use model::{
    ChangeRecord, Entity, EntityKind, Field, FieldValue, Folder, Mutation, Note, NoteEdit, Stamp,
    UNSORTED_FOLDER_ID, UNSORTED_FOLDER_NAME,
};
pub use store::{EntityStore, Snapshot, StoreDelta, StoreError};
pub use tagging::{TagSuggester, TagSuggestion, TaggingError};
