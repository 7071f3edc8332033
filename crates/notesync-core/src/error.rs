//! Engine-level errors, grouped by how the caller should react.

use crate::backup::BackupError;
use crate::change_log::LogError;
use crate::clock::ClockError;
use crate::config::ConfigError;
use crate::context::SyncKeyError;
use crate::fs::FsError;
use crate::mirror::MirrorError;
use crate::model::ModelError;
use crate::store::StoreError;
use crate::tagging::TaggingError;
use thiserror::Error;

/// How an error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried internally; surfaced only once the retry budget is spent
    Transient,
    /// Rejected input; prior state is untouched
    Validation,
    /// Sync is suspended until reconfigured
    Fatal,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    SyncKey(#[from] SyncKeyError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Tagging(#[from] TaggingError),

    #[error("Cannot file a note under folder {0}: it does not exist or is deleted")]
    InvalidFolder(uuid::Uuid),

    #[error("The Unsorted folder cannot be deleted")]
    BuiltInFolder,

    #[error("Sync suspended: {0}")]
    Suspended(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Mirror(e) if e.is_retryable() => ErrorClass::Transient,
            SyncError::Mirror(MirrorError::Malformed(_)) => ErrorClass::Validation,
            SyncError::Mirror(_) => ErrorClass::Fatal,
            SyncError::Tagging(_) => ErrorClass::Transient,
            SyncError::Log(LogError::Invalid(_))
            | SyncError::Store(_)
            | SyncError::Backup(_)
            | SyncError::Config(_)
            | SyncError::SyncKey(_)
            | SyncError::Model(_)
            | SyncError::InvalidFolder(_)
            | SyncError::BuiltInFolder => ErrorClass::Validation,
            SyncError::Log(_)
            | SyncError::Clock(_)
            | SyncError::Fs(_)
            | SyncError::Suspended(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
