//! In-memory document store for tests and simulations.
//!
//! Share one instance between several mirrors (wrap it in `Arc`) to simulate
//! devices talking to the same cloud collection. Failures can be injected to
//! exercise retry and suspension paths.

use super::{DocumentStore, MirrorError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, BTreeMap<Uuid, Value>>,
    watchers: Vec<(String, mpsc::UnboundedSender<Value>)>,
    offline: bool,
    denied: bool,
    fail_next: u32,
    upserts: usize,
}

impl Inner {
    fn check(&self, collection: &str) -> Result<()> {
        if self.denied {
            return Err(MirrorError::PermissionDenied(collection.to_string()));
        }
        if self.offline {
            return Err(MirrorError::Unavailable("store is offline".into()));
        }
        Ok(())
    }

    fn notify(&mut self, collection: &str, document: &Value) {
        self.watchers
            .retain(|(c, tx)| c != collection || tx.send(document.clone()).is_ok());
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    inner: Mutex<Inner>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// While offline every call fails with a retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// While denied every call fails with a fatal error.
    pub fn deny_access(&self, denied: bool) {
        self.lock().denied = denied;
    }

    /// Fail the next `n` upserts with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Re-send every document of `collection` to its watchers, as an
    /// at-least-once feed may after a reconnect.
    pub fn redeliver(&self, collection: &str) {
        let mut inner = self.lock();
        let docs: Vec<Value> = inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        for doc in docs {
            inner.notify(collection, &doc);
        }
    }

    /// Write a raw document, bypassing any validation, and notify watchers.
    pub fn inject(&self, collection: &str, id: Uuid, document: Value) {
        let mut inner = self.lock();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, document.clone());
        inner.notify(collection, &document);
    }

    pub fn document(&self, collection: &str, id: Uuid) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(&id).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock().collections.get(collection).map_or(0, |c| c.len())
    }

    pub fn upsert_count(&self) -> usize {
        self.lock().upserts
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn upsert(&self, collection: &str, id: Uuid, document: Value) -> Result<()> {
        let mut inner = self.lock();
        inner.check(collection)?;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(MirrorError::Unavailable("injected failure".into()));
        }
        inner.upserts += 1;
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, document.clone());
        inner.notify(collection, &document);
        Ok(())
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>> {
        let inner = self.lock();
        inner.check(collection)?;
        Ok(inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, collection: &str, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        inner.check(collection)?;
        if let Some(c) = inner.collections.get_mut(collection) {
            c.remove(&id);
        }
        Ok(())
    }

    async fn watch(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<Value>> {
        let mut inner = self.lock();
        inner.check(collection)?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push((collection.to_string(), tx));
        Ok(rx)
    }
}
