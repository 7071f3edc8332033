//! Engine configuration, read from YAML.
//!
//! ```yaml
//! retention_ms: 2592000000        # 30 days
//! tombstone_fallback_ms: 7776000000
//! tag_timeout_ms: 5000
//! resurrection: resurrect_on_edit # or tombstone_wins
//! retry:
//!   initial_delay_ms: 500
//!   max_delay_ms: 30000
//!   factor: 2.0
//!   jitter: 0.2
//!   max_attempts: 5
//! ```
//!
//! Every key is optional. All devices sharing a sync key must use the same
//! `resurrection` policy or their trees can diverge.

use crate::fs::{FileSystem, FsError};
use crate::lww::ResurrectionPolicy;
use crate::mirror::RetryPolicy;
use crate::reconcile::CompactionWindows;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default config location relative to the data directory.
pub const CONFIG_PATH: &str = "notesync.yaml";

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Fs(#[from] FsError),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum age before confirmed records and observed tombstones are removed
    pub retention_ms: u64,
    /// Age after which tombstones are removed even if not every device saw them
    pub tombstone_fallback_ms: u64,
    pub retry: RetryPolicy,
    pub tag_timeout_ms: u64,
    pub resurrection: ResurrectionPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention_ms: 30 * DAY_MS,
            tombstone_fallback_ms: 90 * DAY_MS,
            retry: RetryPolicy::default(),
            tag_timeout_ms: 5_000,
            resurrection: ResurrectionPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid, all-defaults config
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: SyncConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub async fn load<F: FileSystem + ?Sized>(fs: &F, path: &str) -> Result<Self, ConfigError> {
        match fs.read(path).await {
            Ok(bytes) => Self::from_yaml(&String::from_utf8_lossy(&bytes)),
            Err(FsError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tombstone_fallback_ms < self.retention_ms {
            return Err(ConfigError::Invalid(
                "tombstone_fallback_ms must not be shorter than retention_ms".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be between 0 and 1".into()));
        }
        Ok(())
    }

    pub fn tag_timeout(&self) -> Duration {
        Duration::from_millis(self.tag_timeout_ms)
    }

    pub fn compaction_windows(&self) -> CompactionWindows {
        CompactionWindows {
            retention_ms: self.retention_ms,
            fallback_ms: self.tombstone_fallback_ms,
        }
    }
}
