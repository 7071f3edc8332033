//! Change log: every record this device has made or merged, in stamp order.
//!
//! Local mutations are stamped here and stay unconfirmed until the mirror
//! acknowledges a push that carried them. Remote records are logged as
//! confirmed (they came from the mirror). The clock state is written to disk
//! before a stamp is handed out, so stamps stay strictly increasing across
//! restarts.
//!
//! Files:
//! - `.sync/changes.json` - entries and confirmation flags
//! - `.sync/clock.json` - last issued or observed timestamp
//! - `.sync/devices.json` - see [`crate::devices`]

use crate::DeviceId;
use crate::clock::{ClockError, HybridClock, Timestamp};
use crate::context::SyncContext;
use crate::devices::KnownDevices;
use crate::fs::{self, FileSystem, FsError};
use crate::model::{ChangeRecord, ModelError, Mutation, Stamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHANGES_PATH: &str = ".sync/changes.json";
pub const CLOCK_PATH: &str = ".sync/clock.json";

const LOG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Change log storage failed: {0}")]
    Fs(#[from] FsError),

    #[error("Unsupported change log version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid change: {0}")]
    Invalid(#[from] ModelError),

    #[error(transparent)]
    Clock(#[from] ClockError),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// A logged record and whether the mirror has acknowledged it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedChange {
    pub record: ChangeRecord,
    pub confirmed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogFile {
    version: u32,
    entries: Vec<LoggedChange>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClockFile {
    last: Timestamp,
}

type Key = (Stamp, Uuid);

pub struct ChangeLog<F: FileSystem> {
    fs: F,
    clock: HybridClock,
    device_id: DeviceId,
    entries: BTreeMap<Key, LoggedChange>,
    devices: KnownDevices,
}

impl<F: FileSystem> ChangeLog<F> {
    /// Load the log from `fs`, restoring the clock past everything on disk.
    pub async fn open(fs: F, ctx: &SyncContext) -> Result<Self> {
        let file: Option<LogFile> = fs::read_json(&fs, CHANGES_PATH).await?;
        let entries = match file {
            Some(file) if file.version > LOG_VERSION => {
                return Err(LogError::UnsupportedVersion(file.version));
            }
            Some(file) => file.entries,
            None => Vec::new(),
        };

        if let Some(saved) = fs::read_json::<ClockFile, _>(&fs, CLOCK_PATH).await? {
            ctx.clock.observe(saved.last);
        }
        let devices = KnownDevices::load(&fs).await?;

        let entries: BTreeMap<Key, LoggedChange> = entries
            .into_iter()
            .map(|e| ((e.record.stamp(), e.record.entity_id), e))
            .collect();
        if let Some(((latest, _), _)) = entries.last_key_value() {
            ctx.clock.observe(latest.at);
        }

        info!(
            entries = entries.len(),
            clock = %ctx.clock.last(),
            "Opened change log"
        );
        Ok(Self {
            fs,
            clock: ctx.clock.clone(),
            device_id: ctx.device_id,
            entries,
            devices,
        })
    }

    /// Stamp a UI mutation and append it, unconfirmed.
    pub async fn record(&mut self, mutation: Mutation) -> Result<ChangeRecord> {
        let entity_id = mutation.entity_id();
        let entity_kind = mutation.entity_kind();

        let at = self.clock.tick()?;
        fs::write_json(&self.fs, CLOCK_PATH, &ClockFile { last: at }).await?;

        let record = ChangeRecord {
            entity_id,
            entity_kind,
            fields_changed: mutation.into_fields(at),
            timestamp: at,
            origin_device: self.device_id,
        };
        record.validate()?;

        self.devices.observe(record.stamp(), self.clock.wall_now());
        self.entries.insert(
            (record.stamp(), entity_id),
            LoggedChange {
                record: record.clone(),
                confirmed: false,
            },
        );
        self.save().await?;
        debug!(entity = %entity_id, stamp = %record.stamp(), "Recorded local change");
        Ok(record)
    }

    /// Log records received from the mirror. Returns the ones that added
    /// anything new; replays are dropped here.
    pub async fn ingest(&mut self, records: &[ChangeRecord]) -> Result<Vec<ChangeRecord>> {
        let now = self.clock.wall_now();
        let mut fresh = Vec::new();
        for record in records {
            if !self.clock.admits(record.timestamp) {
                warn!(
                    entity = %record.entity_id,
                    stamp = %record.stamp(),
                    "Skipping remote change stamped too far in the future"
                );
                continue;
            }
            self.clock.observe(record.timestamp);
            self.devices.observe(record.stamp(), now);
            if self.insert_confirmed(record) {
                fresh.push(record.clone());
            }
        }
        if !fresh.is_empty() {
            self.save().await?;
        }
        Ok(fresh)
    }

    fn insert_confirmed(&mut self, record: &ChangeRecord) -> bool {
        let key = (record.stamp(), record.entity_id);
        match self.entries.get_mut(&key) {
            // Same write delivered with a different field subset
            Some(existing) => {
                let mut added = false;
                for (field, value) in &record.fields_changed {
                    if !existing.record.fields_changed.contains_key(field) {
                        existing
                            .record
                            .fields_changed
                            .insert(*field, value.clone());
                        added = true;
                    }
                }
                added
            }
            None => {
                self.entries.insert(
                    key,
                    LoggedChange {
                        record: record.clone(),
                        confirmed: true,
                    },
                );
                true
            }
        }
    }

    /// Records stamped strictly after `ts`, in stamp order.
    pub fn since(&self, ts: Timestamp) -> Vec<ChangeRecord> {
        self.entries
            .values()
            .filter(|e| e.record.timestamp > ts)
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.entries.values().map(|e| &e.record)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LoggedChange> {
        self.entries.values()
    }

    /// Entities with at least one unconfirmed record.
    pub fn pending_entities(&self) -> BTreeSet<Uuid> {
        self.entries
            .values()
            .filter(|e| !e.confirmed)
            .map(|e| e.record.entity_id)
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.entries.values().filter(|e| !e.confirmed).count()
    }

    /// Whether every record of `id` has been acknowledged by the mirror.
    pub fn is_confirmed(&self, id: Uuid) -> bool {
        self.entries
            .values()
            .filter(|e| e.record.entity_id == id)
            .all(|e| e.confirmed)
    }

    pub fn latest_for(&self, id: Uuid) -> Option<&ChangeRecord> {
        self.entries
            .values()
            .rev()
            .map(|e| &e.record)
            .find(|r| r.entity_id == id)
    }

    /// Mark records of `id` stamped at or before `upto` as acknowledged.
    pub async fn confirm(&mut self, id: Uuid, upto: Stamp) -> Result<usize> {
        let mut confirmed = 0;
        for entry in self.entries.values_mut() {
            if entry.record.entity_id == id && !entry.confirmed && entry.record.stamp() <= upto {
                entry.confirmed = true;
                confirmed += 1;
            }
        }
        if confirmed > 0 {
            self.save().await?;
        }
        Ok(confirmed)
    }

    /// Forget every acknowledgement, e.g. after switching collections.
    pub async fn unconfirm_all(&mut self) -> Result<()> {
        for entry in self.entries.values_mut() {
            entry.confirmed = false;
        }
        self.save().await
    }

    /// Drop confirmed records older than `cutoff_ms`, keeping the latest
    /// record of every entity.
    pub async fn prune(&mut self, cutoff_ms: u64) -> Result<usize> {
        let mut latest: BTreeMap<Uuid, Key> = BTreeMap::new();
        for key in self.entries.keys() {
            latest.insert(key.1, *key);
        }
        let keep: BTreeSet<Key> = latest.into_values().collect();

        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            keep.contains(key) || !entry.confirmed || entry.record.timestamp.wall_ms >= cutoff_ms
        });
        let pruned = before - self.entries.len();
        if pruned > 0 {
            self.save().await?;
            debug!(pruned, "Pruned change log");
        }
        Ok(pruned)
    }

    /// Remove every record of a compacted entity.
    pub async fn remove_entity(&mut self, id: Uuid) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|(_, entity), _| *entity != id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Replace the whole log, e.g. after a backup import. The new records are
    /// unconfirmed so they get pushed.
    pub async fn replace_all(&mut self, records: Vec<ChangeRecord>) -> Result<()> {
        self.entries = records
            .into_iter()
            .map(|record| {
                self.clock.observe(record.timestamp);
                (
                    (record.stamp(), record.entity_id),
                    LoggedChange {
                        record,
                        confirmed: false,
                    },
                )
            })
            .collect();
        fs::write_json(
            &self.fs,
            CLOCK_PATH,
            &ClockFile {
                last: self.clock.last(),
            },
        )
        .await?;
        self.save().await
    }

    pub fn devices(&self) -> &KnownDevices {
        &self.devices
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn save(&self) -> Result<()> {
        let file = LogFile {
            version: LOG_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        fs::write_json(&self.fs, CHANGES_PATH, &file).await?;
        self.devices.save(&self.fs).await?;
        Ok(())
    }
}
