//! Document store backed by a directory, one JSON file per document:
//! `<root>/<collection>/<entity-id>.json`.
//!
//! Point several devices at a shared (e.g. network-synced) directory to use
//! it as a remote. Writes made through the same instance reach watchers
//! immediately. Writes from other processes are found by polling the
//! collection directory, so a watcher may see the same document twice.

use super::{DocumentStore, MirrorError, Result};
use crate::fs::{FileSystem, FsError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct DirectoryDocumentStore<F: FileSystem> {
    fs: Arc<F>,
    root: String,
    poll_interval: Duration,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<Value>)>>,
}

fn storage_error(e: FsError) -> MirrorError {
    MirrorError::Unavailable(e.to_string())
}

/// Every readable document in `dir`, keyed by file name.
async fn read_collection<F: FileSystem>(fs: &F, dir: &str) -> Result<BTreeMap<String, Value>> {
    let entries = match fs.list(dir).await {
        Ok(entries) => entries,
        Err(FsError::NotFound(_)) => return Ok(BTreeMap::new()),
        Err(e) => return Err(storage_error(e)),
    };

    let mut documents = BTreeMap::new();
    for entry in entries {
        if entry.is_dir || !entry.name.ends_with(".json") {
            continue;
        }
        let path = format!("{}/{}", dir, entry.name);
        let bytes = match fs.read(&path).await {
            Ok(bytes) => bytes,
            // Removed between list and read
            Err(FsError::NotFound(_)) => continue,
            Err(e) => return Err(storage_error(e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                documents.insert(entry.name, value);
            }
            Err(e) => warn!(path = %path, "Skipping unreadable document: {}", e),
        }
    }
    Ok(documents)
}

impl<F: FileSystem + 'static> DirectoryDocumentStore<F> {
    pub fn new(fs: F, root: impl Into<String>) -> Self {
        Self {
            fs: Arc::new(fs),
            root: root.into().trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// How often watchers rescan the collection for writes by other processes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    fn collection_dir(&self, collection: &str) -> String {
        format!("{}/{}", self.root, collection)
    }

    fn document_path(&self, collection: &str, id: Uuid) -> String {
        format!("{}/{}.json", self.collection_dir(collection), id)
    }

    /// Rescan `dir` every poll interval and send documents that are new or
    /// changed since the previous scan. Stops once the receiver is dropped.
    fn spawn_poller(
        &self,
        dir: String,
        mut seen: BTreeMap<String, Value>,
        tx: mpsc::UnboundedSender<Value>,
    ) {
        let fs = self.fs.clone();
        let period = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let current = match read_collection(fs.as_ref(), &dir).await {
                    Ok(current) => current,
                    Err(e) => {
                        debug!(dir = %dir, "Polling mirror directory failed: {}", e);
                        continue;
                    }
                };
                for (name, document) in &current {
                    if seen.get(name) != Some(document) && tx.send(document.clone()).is_err() {
                        return;
                    }
                }
                seen = current;
            }
            debug!(dir = %dir, "Stopped polling mirror directory");
        });
    }
}

#[async_trait]
impl<F: FileSystem + 'static> DocumentStore for DirectoryDocumentStore<F> {
    async fn upsert(&self, collection: &str, id: Uuid, document: Value) -> Result<()> {
        super::validate_collection(collection)?;
        let bytes =
            serde_json::to_vec_pretty(&document).map_err(|e| MirrorError::Malformed(e.to_string()))?;
        self.fs
            .write(&self.document_path(collection, id), &bytes)
            .await
            .map_err(storage_error)?;

        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(c, tx)| c != collection || tx.send(document.clone()).is_ok());
        Ok(())
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>> {
        super::validate_collection(collection)?;
        let documents = read_collection(self.fs.as_ref(), &self.collection_dir(collection)).await?;
        Ok(documents.into_values().collect())
    }

    async fn remove(&self, collection: &str, id: Uuid) -> Result<()> {
        super::validate_collection(collection)?;
        match self.fs.delete(&self.document_path(collection, id)).await {
            Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn watch(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<Value>> {
        super::validate_collection(collection)?;
        let dir = self.collection_dir(collection);
        // Documents already present are for fetch_all, not the feed
        let seen = read_collection(self.fs.as_ref(), &dir).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((collection.to_string(), tx.clone()));
        self.spawn_poller(dir, seen, tx);
        Ok(rx)
    }
}
