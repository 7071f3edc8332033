//! Remote mirror adapter.
//!
//! The remote side is a dumb document store: one collection per sync key,
//! one JSON document per entity, whole-document upserts and a realtime
//! change feed. [`DocumentStore`] is that contract; [`RemoteMirror`] layers
//! validation, merging, retries and subscriptions on top of it.
//!
//! The mirror remembers the last version of every document it has pushed or
//! received. A push merges the outgoing records into that version, so fields
//! written by other devices are carried along instead of being overwritten.

mod directory;
mod document;
mod memory;
mod retry;

pub use directory::DirectoryDocumentStore;
pub use document::{RemoteDocument, RemoteField};
pub use memory::InMemoryDocumentStore;
pub use retry::RetryPolicy;

use crate::clock::HybridClock;
use crate::context::SyncKey;
use crate::lww::ResurrectionPolicy;
use crate::model::ChangeRecord;
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MirrorError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied for collection {0}")]
    PermissionDenied(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("Malformed remote document: {0}")]
    Malformed(String),

    #[error("Subscription closed")]
    Closed,
}

impl MirrorError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MirrorError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Result of pushing a batch of records.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Every entity in the batch is now reflected remotely. `skipped` counts
    /// entities whose remote document already held the merged state.
    Ack { pushed: usize, skipped: usize },
    Retryable(String),
    Fatal(String),
}

/// Raw remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create or replace the document `id` in `collection`.
    async fn upsert(&self, collection: &str, id: Uuid, document: Value) -> Result<()>;

    /// Every document currently in `collection`.
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>>;

    async fn remove(&self, collection: &str, id: Uuid) -> Result<()>;

    /// Realtime feed of documents written to `collection` from now on.
    /// Delivery is at-least-once; the feed ends when the receiver is dropped.
    async fn watch(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<Value>>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<T> {
    async fn upsert(&self, collection: &str, id: Uuid, document: Value) -> Result<()> {
        (**self).upsert(collection, id, document).await
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>> {
        (**self).fetch_all(collection).await
    }

    async fn remove(&self, collection: &str, id: Uuid) -> Result<()> {
        (**self).remove(collection, id).await
    }

    async fn watch(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<Value>> {
        (**self).watch(collection).await
    }
}

pub(crate) fn validate_collection(collection: &str) -> Result<()> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MirrorError::InvalidCollection(collection.to_string()))
    }
}

/// A validated remote document and the records it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub document: RemoteDocument,
    pub records: Vec<ChangeRecord>,
}

impl RemoteChange {
    /// Validate a raw document. With a clock, documents carrying a stamp too
    /// far ahead of it are rejected.
    fn parse(value: Value, clock: Option<&HybridClock>) -> Result<Self> {
        let document = RemoteDocument::from_json(value)?;
        let records = document.to_records();
        if let Some(clock) = clock {
            if let Some(record) = records.iter().find(|r| !clock.admits(r.timestamp)) {
                return Err(MirrorError::Malformed(format!(
                    "document {} is stamped {} ahead of the local clock",
                    document.id, record.timestamp
                )));
            }
        }
        Ok(Self { document, records })
    }
}

/// Cancellable, long-lived listener on one collection.
///
/// Yields remote changes as they arrive. Malformed documents are yielded as
/// errors so the consumer can log and skip them. Dropping the subscription
/// or calling [`cancel`](Self::cancel) stops delivery.
pub struct Subscription {
    collection: String,
    rx: mpsc::UnboundedReceiver<Value>,
    clock: Option<HybridClock>,
    cancelled: bool,
}

impl Subscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Wait for the next change. `None` once cancelled or the feed ends.
    pub async fn next_change(&mut self) -> Option<Result<RemoteChange>> {
        if self.cancelled {
            return None;
        }
        let value = self.rx.recv().await?;
        Some(RemoteChange::parse(value, self.clock.as_ref()))
    }

    /// Next change if one is already queued.
    pub fn try_next_change(&mut self) -> Option<Result<RemoteChange>> {
        if self.cancelled {
            return None;
        }
        let value = self.rx.try_recv().ok()?;
        Some(RemoteChange::parse(value, self.clock.as_ref()))
    }

    pub fn cancel(&mut self) {
        if !self.cancelled {
            debug!(collection = %self.collection, "Cancelling subscription");
            self.cancelled = true;
            self.rx.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Stream for Subscription {
    type Item = Result<RemoteChange>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        let this = self.get_mut();
        let clock = this.clock.as_ref();
        this.rx
            .poll_recv(cx)
            .map(|value| value.map(|value| RemoteChange::parse(value, clock)))
    }
}

/// Sync-key-scoped view of a [`DocumentStore`].
pub struct RemoteMirror<S: DocumentStore> {
    store: S,
    collection: String,
    policy: ResurrectionPolicy,
    retry: RetryPolicy,
    /// Local clock remote stamps are checked against
    clock: Option<HybridClock>,
    /// Last version of each document seen remotely
    known: BTreeMap<Uuid, RemoteDocument>,
}

impl<S: DocumentStore> RemoteMirror<S> {
    pub fn new(store: S, key: &SyncKey, policy: ResurrectionPolicy, retry: RetryPolicy) -> Self {
        Self {
            store,
            collection: key.collection(),
            policy,
            retry,
            clock: None,
            known: BTreeMap::new(),
        }
    }

    /// Reject remote documents stamped more than
    /// [`MAX_CLOCK_DRIFT_MS`](crate::clock::MAX_CLOCK_DRIFT_MS) ahead of
    /// `clock`, both in [`fetch_all`](Self::fetch_all) and on subscriptions.
    pub fn with_clock(mut self, clock: HybridClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Point the mirror at another collection. Everything known about the
    /// previous one is forgotten.
    pub fn set_sync_key(&mut self, key: &SyncKey) {
        self.collection = key.collection();
        self.known.clear();
        info!(collection = %self.collection, "Switched remote collection");
    }

    /// Push records, one whole-document upsert per entity. Entities whose
    /// remote document already contains the merged state are skipped.
    pub async fn push(&mut self, records: &[ChangeRecord]) -> PushOutcome {
        if let Err(e) = validate_collection(&self.collection) {
            return PushOutcome::Fatal(e.to_string());
        }

        let mut by_entity: BTreeMap<Uuid, Vec<&ChangeRecord>> = BTreeMap::new();
        for record in records {
            by_entity.entry(record.entity_id).or_default().push(record);
        }

        let (mut pushed, mut skipped) = (0, 0);
        for (id, records) in by_entity {
            let kind = records[0].entity_kind;
            let mut merged = match self.known.get(&id) {
                Some(doc) if doc.kind == kind => doc.clone(),
                _ => RemoteDocument::new(id, kind),
            };
            let mut changed = false;
            for record in records {
                changed |= merged.merge_record(record, self.policy);
            }
            if !changed {
                skipped += 1;
                continue;
            }

            let json = match merged.to_json() {
                Ok(json) => json,
                Err(e) => return PushOutcome::Fatal(e.to_string()),
            };
            match self.store.upsert(&self.collection, id, json).await {
                Ok(()) => {
                    self.known.insert(id, merged);
                    pushed += 1;
                }
                Err(e) if e.is_retryable() => return PushOutcome::Retryable(e.to_string()),
                Err(e) => return PushOutcome::Fatal(e.to_string()),
            }
        }
        debug!(pushed, skipped, "Push acknowledged");
        PushOutcome::Ack { pushed, skipped }
    }

    /// [`push`](Self::push) with exponential backoff on retryable failures.
    /// Gives up after the configured number of attempts and returns the last
    /// `Retryable`.
    pub async fn push_with_retry(&mut self, records: &[ChangeRecord]) -> PushOutcome {
        let mut attempt = 1;
        loop {
            match self.push(records).await {
                PushOutcome::Retryable(reason) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        "Push failed ({}), retrying in {:?}",
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Bulk catch-up: every valid document in the collection. Malformed
    /// documents are logged and skipped.
    pub async fn fetch_all(&mut self) -> Result<Vec<RemoteChange>> {
        validate_collection(&self.collection)?;
        let raw = self.store.fetch_all(&self.collection).await?;
        let mut changes = Vec::with_capacity(raw.len());
        for value in raw {
            match RemoteChange::parse(value, self.clock.as_ref()) {
                Ok(change) => {
                    self.observe(&change.document);
                    changes.push(change);
                }
                Err(e) => warn!("Skipping remote document: {}", e),
            }
        }
        info!(
            collection = %self.collection,
            documents = changes.len(),
            "Fetched remote collection"
        );
        Ok(changes)
    }

    /// Listen for changes to the collection of the current sync key, the
    /// one given to [`new`](Self::new) or the last
    /// [`set_sync_key`](Self::set_sync_key). A subscription stays bound to
    /// that collection; after switching keys, cancel it and subscribe again.
    pub async fn subscribe(&self) -> Result<Subscription> {
        validate_collection(&self.collection)?;
        let rx = self.store.watch(&self.collection).await?;
        debug!(collection = %self.collection, "Subscribed to remote changes");
        Ok(Subscription {
            collection: self.collection.clone(),
            rx,
            clock: self.clock.clone(),
            cancelled: false,
        })
    }

    /// Whether `subscription` listens to the collection this mirror
    /// currently reads and writes.
    pub fn is_current(&self, subscription: &Subscription) -> bool {
        subscription.collection == self.collection
    }

    /// Remember a document as the current remote version.
    pub fn observe(&mut self, document: &RemoteDocument) {
        self.known.insert(document.id, document.clone());
    }

    pub fn remote_document(&self, id: Uuid) -> Option<&RemoteDocument> {
        self.known.get(&id)
    }

    /// Whether the remote copy of `local.id` is missing or holds a different
    /// state than `local`.
    pub fn differs_from_remote(&self, local: &RemoteDocument) -> bool {
        self.known.get(&local.id) != Some(local)
    }

    /// Physically delete a document (tombstone compaction).
    pub async fn remove(&mut self, id: Uuid) -> Result<()> {
        validate_collection(&self.collection)?;
        self.store.remove(&self.collection, id).await?;
        self.known.remove(&id);
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
