//! SyncEngine: ties the store, change log, mirror and reconciler together.
//!
//! Data flow:
//!
//! 1. A UI intent is validated, stamped by the change log and applied to the
//!    entity store immediately. The entity is queued in the outbox.
//! 2. `flush` pushes queued entities (whole current state) to the mirror,
//!    retrying transient failures, and confirms their log records on Ack.
//! 3. Remote documents (bulk on `connect`, then from the subscription) are
//!    logged, buffered in the reconciler and applied in stamp order. Any
//!    entity whose merged state differs from the remote copy is pushed back.
//!
//! The engine is a single value driven through `&mut self`; callers
//! serialize access to it. Nothing here blocks except mirror and disk I/O.

use crate::backup::{self, BackupDocument};
use crate::change_log::ChangeLog;
use crate::config::SyncConfig;
use crate::context::{SyncContext, SyncKey};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent, SyncStatus};
use crate::fs::FileSystem;
use crate::mirror::{
    DocumentStore, MirrorError, PushOutcome, RemoteChange, RemoteDocument, RemoteMirror,
    Subscription,
};
use crate::model::{Entity, Folder, Mutation, Note, NoteEdit, Stamp, UNSORTED_FOLDER_ID};
use crate::outbox::Outbox;
use crate::reconcile::{self, Reconciler};
use crate::store::{EntityStore, Snapshot, StoreDelta, StoreError};
use crate::tagging::{self, TagSuggester};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a pass over remote changes did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    pub received: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub pushed_back: usize,
    pub delta: StoreDelta,
}

/// What `compact` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub tombstones: usize,
    pub log_records: usize,
    /// Tombstones kept because their remote document could not be removed
    pub deferred: usize,
}

pub struct SyncEngine<F: FileSystem + Clone, S: DocumentStore> {
    ctx: SyncContext,
    config: SyncConfig,
    fs: F,
    store: EntityStore,
    log: ChangeLog<F>,
    mirror: RemoteMirror<S>,
    reconciler: Reconciler,
    outbox: Outbox,
    subscription: Option<Subscription>,
    status: SyncStatus,
    events: Arc<EventBus>,
}

impl<F: FileSystem + Clone, S: DocumentStore> SyncEngine<F, S> {
    /// Open the local state in `fs` and prepare (but do not connect) the
    /// mirror. Unpushed changes from a previous session are re-queued.
    pub async fn open(fs: F, remote: S, ctx: SyncContext, config: SyncConfig) -> Result<Self> {
        let log = ChangeLog::open(fs.clone(), &ctx).await?;

        let mut store = EntityStore::load(&fs, config.resurrection).await?;
        // Records logged but not yet saved into the store (interrupted session)
        for record in log.records() {
            store.apply(record);
        }

        let mut outbox = Outbox::new();
        for id in log.pending_entities() {
            if let Some(latest) = log.latest_for(id) {
                outbox.enqueue(id, latest.stamp());
            }
        }

        let mirror = RemoteMirror::new(
            remote,
            &ctx.sync_key,
            config.resurrection,
            config.retry.clone(),
        )
        .with_clock(ctx.clock.clone());

        info!(
            device = %ctx.device_id,
            entities = store.len(),
            pending = outbox.len(),
            "Opened sync engine"
        );
        Ok(Self {
            ctx,
            config,
            fs,
            store,
            log,
            mirror,
            reconciler: Reconciler::new(),
            outbox,
            subscription: None,
            status: SyncStatus::Offline,
            events: Arc::new(EventBus::new()),
        })
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn get(&self, id: Uuid) -> Result<Entity> {
        Ok(self.store.get(id)?)
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn folders(&self) -> Vec<Folder> {
        self.store.folders()
    }

    pub fn notes_in(&self, folder: Uuid) -> Vec<Note> {
        self.store.notes_in(folder)
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn change_log(&self) -> &ChangeLog<F> {
        &self.log
    }

    pub fn mirror(&self) -> &RemoteMirror<S> {
        &self.mirror
    }

    /// Entities waiting to be pushed.
    pub fn pending_pushes(&self) -> usize {
        self.outbox.len()
    }

    pub fn coalesced_pushes(&self) -> u64 {
        self.outbox.coalesced()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    // ------------------------------------------------------------------
    // UI intents
    // ------------------------------------------------------------------

    pub async fn create_folder(&mut self, name: impl Into<String>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let order_hint = self
            .store
            .folders()
            .iter()
            .filter(|f| f.id != UNSORTED_FOLDER_ID)
            .map(|f| f.order_hint)
            .fold(0.0, f64::max)
            + 1.0;
        self.apply_local(Mutation::CreateFolder {
            id,
            name: name.into(),
            order_hint,
        })
        .await?;
        Ok(id)
    }

    pub async fn rename_folder(&mut self, id: Uuid, name: impl Into<String>) -> Result<StoreDelta> {
        self.apply_local(Mutation::RenameFolder {
            id,
            name: name.into(),
        })
        .await
    }

    pub async fn reorder_folder(&mut self, id: Uuid, order_hint: f64) -> Result<StoreDelta> {
        self.apply_local(Mutation::ReorderFolder { id, order_hint })
            .await
    }

    pub async fn delete_folder(&mut self, id: Uuid) -> Result<StoreDelta> {
        self.apply_local(Mutation::DeleteFolder { id }).await
    }

    pub async fn create_note<I, T>(
        &mut self,
        folder_id: Uuid,
        title: impl Into<String>,
        body: impl Into<String>,
        tags: I,
    ) -> Result<Uuid>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let id = Uuid::new_v4();
        self.apply_local(Mutation::CreateNote {
            id,
            folder_id,
            title: title.into(),
            body: body.into(),
            tags: tagging::normalize_tags(tags),
        })
        .await?;
        Ok(id)
    }

    pub async fn edit_note(&mut self, id: Uuid, edit: NoteEdit) -> Result<StoreDelta> {
        self.apply_local(Mutation::EditNote { id, edit }).await
    }

    pub async fn delete_note(&mut self, id: Uuid) -> Result<StoreDelta> {
        self.apply_local(Mutation::DeleteNote { id }).await
    }

    pub async fn move_note(&mut self, id: Uuid, folder_id: Uuid) -> Result<StoreDelta> {
        self.apply_local(Mutation::MoveNote { id, folder_id }).await
    }

    fn check_intent(&self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::CreateFolder { .. } => Ok(()),
            Mutation::DeleteFolder { id } if *id == UNSORTED_FOLDER_ID => {
                Err(SyncError::BuiltInFolder)
            }
            Mutation::RenameFolder { id, .. }
            | Mutation::ReorderFolder { id, .. }
            | Mutation::DeleteFolder { id } => self.store.get_folder(*id).map(|_| ()).map_err(Into::into),
            Mutation::CreateNote { folder_id, .. } => self.check_folder(*folder_id),
            Mutation::EditNote { id, .. } | Mutation::DeleteNote { id } => {
                self.store.get_note(*id).map(|_| ()).map_err(Into::into)
            }
            Mutation::MoveNote { id, folder_id } => {
                self.store.get_note(*id)?;
                self.check_folder(*folder_id)
            }
        }
    }

    fn check_folder(&self, folder: Uuid) -> Result<()> {
        if self.store.folder_is_live(folder) {
            Ok(())
        } else {
            Err(SyncError::InvalidFolder(folder))
        }
    }

    /// Record and apply one intent. Rejected intents change nothing.
    pub async fn apply_local(&mut self, mutation: Mutation) -> Result<StoreDelta> {
        self.check_intent(&mutation)?;
        let record = self.log.record(mutation).await?;
        let delta = self.store.apply(&record);
        self.store.save(&self.fs).await?;

        if self.outbox.enqueue(record.entity_id, record.stamp()) {
            debug!(entity = %record.entity_id, "Coalesced pending push");
        }
        self.emit_delta(&delta);
        Ok(delta)
    }

    /// Ask the tag service about a note and merge its suggestions. Failures
    /// and timeouts leave the note as it was and return `Ok(None)`.
    pub async fn enrich_note<T: TagSuggester + ?Sized>(
        &mut self,
        id: Uuid,
        suggester: &T,
    ) -> Result<Option<StoreDelta>> {
        let note = self.store.get_note(id)?;
        if note.deleted {
            return Err(StoreError::NotFound(id).into());
        }
        let suggestion =
            match tagging::suggest_with_timeout(suggester, &note.body, self.config.tag_timeout()).await
            {
                Ok(suggestion) => suggestion,
                Err(_) => return Ok(None),
            };

        let mut tags = note.tags.clone();
        tags.extend(tagging::normalize_tags(&suggestion.tags));
        let edit = NoteEdit {
            title: None,
            body: suggestion.enhanced_body.filter(|body| *body != note.body),
            tags: (tags != note.tags).then_some(tags),
        };
        if edit.is_empty() {
            return Ok(None);
        }
        self.edit_note(id, edit).await.map(Some)
    }

    // ------------------------------------------------------------------
    // Remote side
    // ------------------------------------------------------------------

    fn set_status(&mut self, status: SyncStatus) {
        if self.status != status {
            info!(?status, "Sync status changed");
            self.status = status.clone();
            self.events.emit(SyncEvent::StatusChanged { status });
        }
    }

    fn ensure_not_suspended(&self) -> Result<()> {
        match &self.status {
            SyncStatus::Suspended { reason } => Err(SyncError::Suspended(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Record a mirror failure in the status and hand it back as an error.
    fn mirror_failed(&mut self, e: MirrorError) -> SyncError {
        if e.is_retryable() {
            self.set_status(SyncStatus::Degraded {
                reason: e.to_string(),
            });
        } else {
            warn!("Suspending sync: {}", e);
            self.set_status(SyncStatus::Suspended {
                reason: e.to_string(),
            });
        }
        e.into()
    }

    /// Subscribe, catch up with everything in the remote collection and push
    /// whatever is pending.
    pub async fn connect(&mut self) -> Result<PullReport> {
        self.ensure_not_suspended()?;
        self.close_subscription();

        // Subscribe first so nothing written during the catch-up is missed
        let subscription = match self.mirror.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => return Err(self.mirror_failed(e)),
        };
        let changes = match self.mirror.fetch_all().await {
            Ok(changes) => changes,
            Err(e) => return Err(self.mirror_failed(e)),
        };
        self.subscription = Some(subscription);
        self.set_status(SyncStatus::Online);
        info!(collection = %self.mirror.collection(), "Connected to mirror");

        let report = self.merge_remote(changes).await?;
        self.flush().await?;
        Ok(report)
    }

    /// Apply every change already queued on the subscription without waiting.
    pub async fn process_pending(&mut self) -> Result<PullReport> {
        let mut changes = Vec::new();
        if let Some(subscription) = self.subscription.as_mut() {
            debug_assert!(self.mirror.is_current(subscription));
            while let Some(item) = subscription.try_next_change() {
                match item {
                    Ok(change) => changes.push(change),
                    Err(e) => warn!("Ignoring remote document: {}", e),
                }
            }
        }
        self.handle_remote(changes).await
    }

    /// Wait for the next remote change and apply it, along with anything
    /// queued behind it. Returns `None` once the subscription has ended.
    pub async fn process_next(&mut self) -> Result<Option<PullReport>> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(None);
        };
        debug_assert!(self.mirror.is_current(subscription));
        let first = loop {
            match subscription.next_change().await {
                Some(Ok(change)) => break change,
                Some(Err(e)) => warn!("Ignoring remote document: {}", e),
                None => {
                    self.subscription = None;
                    self.set_status(SyncStatus::Offline);
                    return Ok(None);
                }
            }
        };
        let mut report = self.handle_remote(vec![first]).await?;
        let rest = self.process_pending().await?;
        report.received += rest.received;
        report.applied += rest.applied;
        report.unchanged += rest.unchanged;
        report.pushed_back += rest.pushed_back;
        report.delta.absorb(rest.delta);
        Ok(Some(report))
    }

    async fn handle_remote(&mut self, changes: Vec<RemoteChange>) -> Result<PullReport> {
        for change in &changes {
            self.mirror.observe(&change.document);
        }
        self.merge_remote(changes).await
    }

    /// Log, reconcile and push back. The mirror must already know the
    /// documents as the current remote versions.
    async fn merge_remote(&mut self, changes: Vec<RemoteChange>) -> Result<PullReport> {
        if changes.is_empty() {
            return Ok(PullReport::default());
        }
        let records: Vec<_> = changes.iter().flat_map(|c| c.records.iter().cloned()).collect();
        let fresh = self.log.ingest(&records).await?;
        self.reconciler.enqueue(fresh);
        let outcome = self.reconciler.drain_into(&mut self.store);
        if outcome.applied > 0 {
            self.store.save(&self.fs).await?;
        }

        // Push back anything the remote copy does not fully reflect
        let ids: BTreeSet<Uuid> = changes.iter().map(|c| c.document.id).collect();
        let mut stale = Vec::new();
        for id in ids {
            let Some(state) = self.store.entity_state(id) else {
                continue;
            };
            let records = self.store.records_for(id);
            let local = RemoteDocument::from_records(id, state.kind, &records, self.store.policy());
            if self.mirror.differs_from_remote(&local) {
                stale.push(id);
            }
        }
        let pushed_back = stale.len();
        for id in stale {
            let stamp = self
                .store
                .records_for(id)
                .last()
                .map(|r| r.stamp())
                .unwrap_or_else(|| Stamp::new(self.ctx.clock.last(), self.ctx.device_id));
            self.outbox.enqueue(id, stamp);
        }
        if pushed_back > 0 && self.subscription.is_some() {
            debug!(pushed_back, "Pushing merged state back to mirror");
            self.flush().await?;
        }

        let report = PullReport {
            received: records.len(),
            applied: outcome.applied,
            unchanged: outcome.unchanged,
            pushed_back,
            delta: outcome.delta,
        };
        self.events.emit(SyncEvent::Pulled {
            applied: report.applied,
            unchanged: report.unchanged,
            pushed_back,
        });
        self.emit_delta(&report.delta);
        Ok(report)
    }

    /// Push every queued entity. Transient failures are retried with backoff;
    /// once the budget is spent the status becomes `Degraded` and the
    /// entities stay queued. Fatal failures suspend sync.
    pub async fn flush(&mut self) -> Result<PushOutcome> {
        self.ensure_not_suspended()?;
        let queued = self.outbox.take();
        if queued.is_empty() {
            return Ok(PushOutcome::Ack {
                pushed: 0,
                skipped: 0,
            });
        }

        let records: Vec<_> = queued
            .keys()
            .flat_map(|id| self.store.records_for(*id))
            .collect();
        let outcome = self.mirror.push_with_retry(&records).await;
        match &outcome {
            PushOutcome::Ack { pushed, skipped } => {
                for id in queued.keys() {
                    if let Some(latest) = self.log.latest_for(*id).map(|r| r.stamp()) {
                        self.log.confirm(*id, latest).await?;
                    }
                }
                if matches!(self.status, SyncStatus::Degraded { .. }) {
                    let recovered = if self.subscription.is_some() {
                        SyncStatus::Online
                    } else {
                        SyncStatus::Offline
                    };
                    self.set_status(recovered);
                }
                self.events.emit(SyncEvent::Pushed {
                    pushed: *pushed,
                    skipped: *skipped,
                });
                Ok(outcome)
            }
            PushOutcome::Retryable(reason) => {
                warn!("Push retries exhausted: {}", reason);
                self.outbox.restore(queued);
                self.set_status(SyncStatus::Degraded {
                    reason: reason.clone(),
                });
                Ok(outcome)
            }
            PushOutcome::Fatal(reason) => {
                self.outbox.restore(queued);
                let reason = reason.clone();
                self.set_status(SyncStatus::Suspended {
                    reason: reason.clone(),
                });
                Err(SyncError::Suspended(reason))
            }
        }
    }

    fn close_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }

    /// Stop listening for remote changes. Local editing continues.
    pub fn sign_out(&mut self) {
        self.close_subscription();
        self.reconciler.reset();
        self.set_status(SyncStatus::Offline);
        info!("Signed out");
    }

    /// Switch to another sync key. The old subscription is cancelled and
    /// every entity is queued for the new collection. Clears a suspension.
    pub async fn change_sync_key(&mut self, key: SyncKey) -> Result<()> {
        self.close_subscription();
        self.reconciler.reset();
        self.mirror.set_sync_key(&key);
        self.ctx.sync_key = key;
        self.log.unconfirm_all().await?;

        let stamp = Stamp::new(self.ctx.clock.last(), self.ctx.device_id);
        let ids: Vec<Uuid> = self.store.entity_states().map(|(id, _)| *id).collect();
        for id in ids {
            self.outbox.enqueue(id, stamp);
        }
        self.status = SyncStatus::Offline;
        self.events.emit(SyncEvent::StatusChanged {
            status: SyncStatus::Offline,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Remove tombstones every device has seen (or that outlived the fallback
    /// window) and prune confirmed log records past retention.
    pub async fn compact(&mut self) -> Result<CompactionReport> {
        let now = self.ctx.clock.wall_now();
        let windows = self.config.compaction_windows();
        let log = &self.log;
        let candidates = reconcile::compactable(
            &self.store,
            log.devices(),
            |id| log.is_confirmed(id),
            self.ctx.device_id,
            now,
            windows,
        );

        let mut report = CompactionReport::default();
        for tombstone in &candidates {
            // The tombstone stays until the remote copy is gone, so a
            // failed removal is retried by the next compaction.
            if let Err(e) = self.mirror.remove(tombstone.id).await {
                warn!(
                    entity = %tombstone.id,
                    "Could not remove remote document, keeping tombstone: {}",
                    e
                );
                report.deferred += 1;
                continue;
            }
            let delta = self.store.purge(tombstone.id);
            report.log_records += self.log.remove_entity(tombstone.id).await?;
            self.reconciler.forget(tombstone.id);
            self.outbox.remove(tombstone.id);
            self.emit_delta(&delta);
            report.tombstones += 1;
        }
        report.log_records += self
            .log
            .prune(now.saturating_sub(self.config.retention_ms))
            .await?;

        if report.tombstones > 0 {
            self.store.save(&self.fs).await?;
            info!(tombstones = report.tombstones, "Compacted tombstones");
        }
        self.events.emit(SyncEvent::Compacted {
            removed: report.tombstones,
        });
        Ok(report)
    }

    /// Portable snapshot of the local tree.
    pub fn export_backup(&self) -> BackupDocument {
        backup::export(&self.store, self.ctx.clock.wall_now())
    }

    /// Replace the local tree with a backup. On error nothing changes. The
    /// imported entities are queued for pushing.
    pub async fn import_backup(&mut self, doc: &BackupDocument) -> Result<StoreDelta> {
        let stamp = Stamp::new(self.ctx.clock.tick()?, self.ctx.device_id);
        let imported = backup::import(doc, stamp, self.store.policy())?;

        self.log.replace_all(imported.all_records()).await?;
        let delta = EntityStore::diff(&self.store, &imported);
        self.store = imported;
        self.store.save(&self.fs).await?;

        self.reconciler.reset();
        let queued: BTreeMap<Uuid, Stamp> = self
            .store
            .entity_states()
            .map(|(id, _)| (*id, stamp))
            .collect();
        self.outbox.take();
        self.outbox.restore(queued);

        info!(entities = self.store.len(), "Replaced local tree from backup");
        self.emit_delta(&delta);
        Ok(delta)
    }

    fn emit_delta(&self, delta: &StoreDelta) {
        if !delta.is_empty() {
            self.events.emit(SyncEvent::Changed {
                delta: delta.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceId;
    use crate::clock::{HybridClock, ManualClock, WallClock};
    use crate::fs::InMemoryFs;
    use crate::mirror::{InMemoryDocumentStore, RetryPolicy};
    use crate::tagging::{TagSuggestion, TaggingError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Engine = SyncEngine<Arc<InMemoryFs>, Arc<InMemoryDocumentStore>>;

    fn config() -> SyncConfig {
        SyncConfig {
            retry: RetryPolicy::immediate(2),
            retention_ms: 100,
            tombstone_fallback_ms: 10_000,
            ..SyncConfig::default()
        }
    }

    async fn engine_with(
        device: u64,
        remote: Arc<InMemoryDocumentStore>,
        fs: Arc<InMemoryFs>,
    ) -> (Arc<ManualClock>, Engine) {
        let wall = Arc::new(ManualClock::new(1_000));
        let ctx = SyncContext::new(
            DeviceId::from(device),
            SyncKey::new("engine test key").unwrap(),
            HybridClock::new(wall.clone()),
        );
        let engine = SyncEngine::open(fs, remote, ctx, config()).await.unwrap();
        (wall, engine)
    }

    async fn engine(device: u64, remote: Arc<InMemoryDocumentStore>) -> (Arc<ManualClock>, Engine) {
        engine_with(device, remote, Arc::new(InMemoryFs::new())).await
    }

    #[tokio::test]
    async fn test_local_edits_apply_immediately_offline() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote.clone()).await;

        let folder = engine.create_folder("Work").await.unwrap();
        let note = engine
            .create_note(folder, "Draft", "", Vec::<String>::new())
            .await
            .unwrap();
        assert_eq!(engine.notes_in(folder).len(), 1);
        assert_eq!(engine.get(note).unwrap().id(), note);
        assert_eq!(engine.status(), &SyncStatus::Offline);
        assert_eq!(engine.pending_pushes(), 2);
        assert_eq!(remote.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_intents_change_nothing() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote).await;
        let before = engine.snapshot();

        let missing = Uuid::new_v4();
        let err = engine
            .create_note(missing, "x", "", Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidFolder(_)));
        assert!(matches!(
            engine.edit_note(missing, NoteEdit::title("x")).await,
            Err(SyncError::Store(StoreError::NotFound(_)))
        ));
        assert!(matches!(
            engine.delete_folder(UNSORTED_FOLDER_ID).await,
            Err(SyncError::BuiltInFolder)
        ));

        let folder = engine.create_folder("Tmp").await.unwrap();
        engine.delete_folder(folder).await.unwrap();
        assert!(matches!(
            engine.create_note(folder, "x", "", Vec::<String>::new()).await,
            Err(SyncError::InvalidFolder(_))
        ));
        assert_eq!(engine.snapshot().notes, before.notes);
    }

    #[tokio::test]
    async fn test_edits_coalesce_into_one_push() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (wall, mut engine) = engine(1, remote.clone()).await;
        let note = engine
            .create_note(UNSORTED_FOLDER_ID, "a", "", Vec::<String>::new())
            .await
            .unwrap();
        for body in ["b", "c", "d"] {
            wall.advance(1);
            engine.edit_note(note, NoteEdit::body(body)).await.unwrap();
        }
        assert_eq!(engine.pending_pushes(), 1);
        assert_eq!(engine.coalesced_pushes(), 3);

        engine.connect().await.unwrap();
        assert_eq!(remote.upsert_count(), 1);
        assert_eq!(engine.pending_pushes(), 0);
        assert!(engine.change_log().is_confirmed(note));
    }

    #[tokio::test]
    async fn test_outage_degrades_then_recovers() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote.clone()).await;
        engine.connect().await.unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let _sub = engine.events().subscribe(move |event| {
            if let SyncEvent::StatusChanged { status } = event {
                sink.lock().unwrap().push(status.clone());
            }
        });

        remote.set_offline(true);
        engine.create_folder("Later").await.unwrap();
        let outcome = engine.flush().await.unwrap();
        assert!(matches!(outcome, PushOutcome::Retryable(_)));
        assert!(matches!(engine.status(), SyncStatus::Degraded { .. }));
        assert_eq!(engine.pending_pushes(), 1);

        // Local store stays usable
        engine.create_folder("Still works").await.unwrap();

        remote.set_offline(false);
        engine.flush().await.unwrap();
        assert_eq!(engine.status(), &SyncStatus::Online);
        assert_eq!(engine.pending_pushes(), 0);
        assert_eq!(statuses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_suspends_until_key_change() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote.clone()).await;
        engine.create_folder("Secret").await.unwrap();

        remote.deny_access(true);
        let err = engine.connect().await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Fatal);
        assert!(matches!(engine.status(), SyncStatus::Suspended { .. }));
        assert!(matches!(engine.flush().await, Err(SyncError::Suspended(_))));

        remote.deny_access(false);
        engine
            .change_sync_key(SyncKey::new("a brand new key").unwrap())
            .await
            .unwrap();
        assert_eq!(engine.status(), &SyncStatus::Offline);
        engine.connect().await.unwrap();
        assert_eq!(remote.len(engine.mirror().collection()), 1);
    }

    #[tokio::test]
    async fn test_sign_out_cancels_subscription() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut a) = engine(1, remote.clone()).await;
        let (_wall_b, mut b) = engine(2, remote.clone()).await;
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.sign_out();
        assert!(!a.is_subscribed());
        b.create_folder("Unseen").await.unwrap();
        b.flush().await.unwrap();

        let report = a.process_pending().await.unwrap();
        assert_eq!(report.received, 0);
        assert_eq!(a.folders().len(), 1);
    }

    #[tokio::test]
    async fn test_change_sync_key_pushes_everything_to_new_collection() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote.clone()).await;
        engine.connect().await.unwrap();
        engine.create_folder("One").await.unwrap();
        engine
            .create_note(UNSORTED_FOLDER_ID, "n", "", ["x"])
            .await
            .unwrap();
        engine.flush().await.unwrap();
        let old = engine.mirror().collection().to_string();

        engine
            .change_sync_key(SyncKey::new("second sync key").unwrap())
            .await
            .unwrap();
        assert!(!engine.is_subscribed());
        engine.connect().await.unwrap();

        let new = engine.mirror().collection().to_string();
        assert_ne!(old, new);
        assert_eq!(remote.len(&new), remote.len(&old));
    }

    #[tokio::test]
    async fn test_compaction_removes_observed_tombstones() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (wall, mut a) = engine(1, remote.clone()).await;
        let (wall_b, mut b) = engine(2, remote.clone()).await;
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        // A learns about B before the deletion
        b.create_folder("before").await.unwrap();
        b.flush().await.unwrap();
        a.process_pending().await.unwrap();

        let note = a
            .create_note(UNSORTED_FOLDER_ID, "bye", "", Vec::<String>::new())
            .await
            .unwrap();
        a.flush().await.unwrap();
        wall.advance(10);
        a.delete_note(note).await.unwrap();
        a.flush().await.unwrap();
        b.process_pending().await.unwrap();

        // B has produced nothing since the deletion
        wall.advance(1_000);
        assert_eq!(a.compact().await.unwrap().tombstones, 0);

        wall_b.set(wall.now_ms());
        b.create_folder("after").await.unwrap();
        b.flush().await.unwrap();
        a.process_pending().await.unwrap();

        let report = a.compact().await.unwrap();
        assert_eq!(report.tombstones, 1);
        assert!(a.get(note).is_err());
        assert!(remote.document(a.mirror().collection(), note).is_none());
    }

    #[tokio::test]
    async fn test_compaction_keeps_tombstone_until_remote_removal_succeeds() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (wall, mut engine) = engine(1, remote.clone()).await;
        engine.connect().await.unwrap();
        let note = engine
            .create_note(UNSORTED_FOLDER_ID, "gone", "", Vec::<String>::new())
            .await
            .unwrap();
        engine.delete_note(note).await.unwrap();
        engine.flush().await.unwrap();
        let collection = engine.mirror().collection().to_string();

        wall.advance(20_000);
        remote.set_offline(true);
        let report = engine.compact().await.unwrap();
        assert_eq!(report.tombstones, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(engine.store().tombstones().len(), 1);
        assert!(remote.document(&collection, note).is_some());

        remote.set_offline(false);
        let report = engine.compact().await.unwrap();
        assert_eq!(report.tombstones, 1);
        assert_eq!(report.deferred, 0);
        assert!(engine.store().tombstones().is_empty());
        assert!(remote.document(&collection, note).is_none());
    }

    #[tokio::test]
    async fn test_far_future_remote_stamps_do_not_poison_the_clock() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote.clone()).await;
        let collection = engine.mirror().collection().to_string();
        let skewed = serde_json::json!({
            "id": Uuid::new_v4(),
            "kind": "folder",
            "fields": {
                "name": {
                    "value": { "type": "text", "value": "from the future" },
                    "at": { "wallMs": u64::MAX, "counter": u32::MAX },
                    "origin": "00000000000000ff"
                }
            }
        });
        remote.inject(&collection, Uuid::new_v4(), skewed.clone());

        let report = engine.connect().await.unwrap();
        assert_eq!(report.received, 0);
        remote.inject(&collection, Uuid::new_v4(), skewed);
        assert_eq!(engine.process_pending().await.unwrap().applied, 0);
        assert_eq!(engine.context().clock.last(), crate::clock::Timestamp::ZERO);

        let folder = engine.create_folder("Still fine").await.unwrap();
        let stamp = engine.change_log().latest_for(folder).unwrap().timestamp;
        assert_eq!(stamp.wall_ms, 1_000);
        assert_eq!(engine.folders().len(), 2);
    }

    struct Suggest(std::result::Result<TagSuggestion, TaggingError>);

    #[async_trait]
    impl TagSuggester for Suggest {
        async fn suggest(&self, _body: &str) -> std::result::Result<TagSuggestion, TaggingError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_enrich_note_merges_tags_or_leaves_note_alone() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut engine) = engine(1, remote).await;
        let id = engine
            .create_note(UNSORTED_FOLDER_ID, "t", "fix the build", ["work"])
            .await
            .unwrap();

        let failing = Suggest(Err(TaggingError::Unavailable("down".into())));
        assert!(engine.enrich_note(id, &failing).await.unwrap().is_none());

        let ok = Suggest(Ok(TagSuggestion {
            tags: ["CI".to_string()].into(),
            enhanced_body: Some("Fix the build.".into()),
        }));
        assert!(engine.enrich_note(id, &ok).await.unwrap().is_some());
        let note = engine.store().get_note(id).unwrap();
        assert_eq!(note.body, "Fix the build.");
        assert!(note.tags.contains("ci") && note.tags.contains("work"));
    }

    #[tokio::test]
    async fn test_import_replaces_tree_and_bad_import_keeps_it() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let (_wall, mut source) = engine(1, remote.clone()).await;
        let folder = source.create_folder("Exported").await.unwrap();
        source
            .create_note(folder, "n", "body", ["a"])
            .await
            .unwrap();
        let backup = source.export_backup();

        let (_wall_b, mut target) = engine(2, Arc::new(InMemoryDocumentStore::new())).await;
        target.create_folder("Replaced").await.unwrap();
        let before = target.snapshot();

        let mut bad = backup.clone();
        bad.format_version = 9;
        let text = serde_json::to_string(&bad).unwrap();
        assert!(BackupDocument::parse(&text).is_err());
        assert_eq!(target.snapshot(), before);

        let delta = target.import_backup(&backup).await.unwrap();
        assert!(!delta.added.is_empty() && !delta.removed.is_empty());
        assert_eq!(target.snapshot(), source.snapshot());
        assert_eq!(target.pending_pushes(), 2);
    }

    #[tokio::test]
    async fn test_reopen_restores_state_and_pending_pushes() {
        let remote = Arc::new(InMemoryDocumentStore::new());
        let fs = Arc::new(InMemoryFs::new());
        let snapshot = {
            let (_wall, mut engine) = engine_with(1, remote.clone(), fs.clone()).await;
            engine.create_folder("Persisted").await.unwrap();
            engine.snapshot()
        };

        let (_wall, mut engine) = engine_with(1, remote.clone(), fs).await;
        assert_eq!(engine.snapshot(), snapshot);
        assert_eq!(engine.pending_pushes(), 1);
        engine.connect().await.unwrap();
        assert_eq!(remote.len(engine.mirror().collection()), 1);
    }
}
