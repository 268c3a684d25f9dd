//! The public data-access surface.
//!
//! [`DataAccess`] wires the usage meter, local cache, batch coalescer and
//! subscription registry around one remote document store. Nothing here
//! returns an error to the caller: reads degrade to cached or empty results,
//! writes that the meter refuses are dropped, and transport failures are
//! logged and absorbed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crmdata_firestore::{DocumentStore, DOCUMENT_ID_FIELD};
use crmdata_models::{
    merge_payload, Collection, DocKey, OperationKind, Payload, PendingOperation, Query, QuerySpec,
    UsageStats, WriteKind, WriteOptions,
};
use crmdata_storage::KvStore;

use crate::cache::LocalCache;
use crate::clock::{Clock, SystemClock};
use crate::coalescer::{BatchCoalescer, CommitHook, FlushOutcome};
use crate::config::AccessConfig;
use crate::error::AccessError;
use crate::maintenance::{self, MaintenanceReport};
use crate::meter::UsageMeter;
use crate::subscriptions::{DocumentCallback, SubscriptionHandle, SubscriptionRegistry};

/// What happened to a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Queued for the next batch commit and visible to local reads.
    Queued,
    /// Refused by the usage meter; nothing was queued.
    QuotaDenied,
    /// The value did not serialize to a JSON object.
    Invalid,
}

/// Local view of a document with unflushed writes.
///
/// Without a known base (no cache entry when the first patch arrived) the
/// patches are held back and replayed over the next remote read.
#[derive(Debug, Clone, Default)]
struct OverlayEntry {
    value: Option<Payload>,
    base_known: bool,
    patches: Vec<PendingOperation>,
    pending: usize,
}

enum OverlayView {
    Resolved(Option<Payload>),
    Unresolved(Vec<PendingOperation>),
}

/// Where a read got its value from.
enum Fetched {
    Remote(Option<Payload>),
    Fallback(Option<Payload>),
}

type Overlay = Arc<Mutex<HashMap<DocKey, OverlayEntry>>>;

fn lock_overlay(overlay: &Overlay) -> MutexGuard<'_, HashMap<DocKey, OverlayEntry>> {
    overlay.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct AccessInner {
    config: AccessConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    meter: Arc<UsageMeter>,
    cache: Arc<LocalCache>,
    coalescer: BatchCoalescer,
    subscriptions: Arc<SubscriptionRegistry>,
    overlay: Overlay,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Quota-aware access to the CRM document store. Clones share state.
#[derive(Clone)]
pub struct DataAccess {
    inner: Arc<AccessInner>,
}

impl DataAccess {
    pub fn new(config: AccessConfig, store: Arc<dyn DocumentStore>, kv: Arc<dyn KvStore>) -> Self {
        Self::with_clock(config, store, kv, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AccessConfig,
        store: Arc<dyn DocumentStore>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let meter = Arc::new(UsageMeter::new(config.quota, Arc::clone(&kv), Arc::clone(&clock)));
        let cache = Arc::new(LocalCache::new(kv, Arc::clone(&clock), config.cache_ttl));
        let overlay: Overlay = Arc::new(Mutex::new(HashMap::new()));

        let on_commit: CommitHook = {
            let overlay = Arc::clone(&overlay);
            Box::new(move |chunk: &[PendingOperation]| settle_overlay(&overlay, chunk))
        };
        let coalescer = BatchCoalescer::new(
            Arc::clone(&store),
            Arc::clone(&meter),
            config.batch_max_size,
            config.flush_delay,
            Some(on_commit),
        );
        let subscriptions = SubscriptionRegistry::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&meter),
            Arc::clone(&clock),
        );

        Self {
            inner: Arc::new(AccessInner {
                config,
                store,
                clock,
                meter,
                cache,
                coalescer,
                subscriptions,
                overlay,
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<AccessInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read one document.
    ///
    /// Answers from unflushed local writes first. When the meter refuses or
    /// the remote read fails, falls back to the cache; `None` if that is
    /// empty too.
    pub async fn get_document<T: DeserializeOwned>(&self, collection: &Collection<T>, id: &str) -> Option<T> {
        let key = collection.doc(id);
        let payload = self.read_document(&key).await?;
        decode(&key, payload)
    }

    async fn read_document(&self, key: &DocKey) -> Option<Payload> {
        let view = lock_overlay(&self.inner.overlay).get(key).map(|entry| {
            if entry.base_known {
                OverlayView::Resolved(entry.value.clone())
            } else {
                OverlayView::Unresolved(entry.patches.clone())
            }
        });

        match view {
            Some(OverlayView::Resolved(value)) => {
                debug!(document = %key, "Serving pending local write");
                value
            }
            Some(OverlayView::Unresolved(patches)) => {
                let fetched = self.fetch_document(key).await;
                self.resolve_overlay(key, fetched, &patches)
            }
            None => match self.fetch_document(key).await {
                Fetched::Remote(value) | Fetched::Fallback(value) => value,
            },
        }
    }

    async fn fetch_document(&self, key: &DocKey) -> Fetched {
        let inner = &self.inner;

        if !inner.meter.admit(OperationKind::Read, 1) {
            debug!(document = %key, "Read denied, serving cache");
            return Fetched::Fallback(inner.cache.get_document(key));
        }

        match inner.store.get(key).await {
            Ok(Some(doc)) => {
                inner.meter.record_success();
                let payload = doc.into_payload();
                inner.cache.put_document(key, &payload);
                Fetched::Remote(Some(payload))
            }
            Ok(None) => {
                inner.meter.record_success();
                inner.cache.remove_document(key);
                Fetched::Remote(None)
            }
            Err(e) => {
                self.note_failure(AccessError::from(e), "get_document");
                Fetched::Fallback(inner.cache.get_document(key))
            }
        }
    }

    /// Replay held-back patches over a freshly read base.
    ///
    /// A remote read settles the base: the overlay entry and the cache take
    /// the merged value. A cached fallback is merged for this answer only, and
    /// a missing one yields `None` rather than a partial document.
    fn resolve_overlay(&self, key: &DocKey, fetched: Fetched, patches: &[PendingOperation]) -> Option<Payload> {
        let inner = &self.inner;

        match fetched {
            Fetched::Remote(base) => {
                let resolved = {
                    let mut overlay = lock_overlay(&inner.overlay);
                    match overlay.get_mut(key) {
                        Some(entry) if !entry.base_known => {
                            let value = replay(inner.clock.as_ref(), base.clone(), &entry.patches);
                            entry.value = value.clone();
                            entry.base_known = true;
                            entry.patches.clear();
                            Some(value)
                        }
                        Some(entry) => return entry.value.clone(),
                        None => None,
                    }
                };

                match resolved {
                    Some(value) => {
                        debug!(document = %key, "Pending writes resolved against remote value");
                        match &value {
                            Some(payload) => inner.cache.put_document(key, payload),
                            None => inner.cache.remove_document(key),
                        }
                        value
                    }
                    // Committed while the read was in flight
                    None => replay(inner.clock.as_ref(), base, patches),
                }
            }
            Fetched::Fallback(base) => {
                let base = base?;
                replay(inner.clock.as_ref(), Some(base), patches)
            }
        }
    }

    /// Run a query.
    ///
    /// Falls back to the cached result of the same normalized query, or an
    /// empty list.
    pub async fn query_documents<T: DeserializeOwned>(&self, query: &Query<T>) -> Vec<T> {
        let spec = query.spec();
        self.run_query(spec)
            .await
            .into_iter()
            .filter_map(|payload| {
                let id = payload
                    .get(DOCUMENT_ID_FIELD)
                    .and_then(Json::as_str)
                    .unwrap_or_default()
                    .to_string();
                decode(&DocKey::new(spec.collection(), id), payload)
            })
            .collect()
    }

    async fn run_query(&self, spec: &QuerySpec) -> Vec<Payload> {
        let inner = &self.inner;

        if !inner.meter.admit(OperationKind::Read, 1) {
            debug!(collection = %spec.collection(), "Query denied, serving cache");
            return inner.cache.get_query(spec).unwrap_or_default();
        }

        match inner.store.query(spec).await {
            Ok(docs) => {
                inner.meter.record_success();
                inner
                    .meter
                    .record_usage(OperationKind::Read, docs.len().saturating_sub(1) as u64);

                let payloads: Vec<Payload> = docs
                    .into_iter()
                    .map(|doc| {
                        let key = DocKey::new(spec.collection(), doc.id.clone());
                        let payload = doc.into_payload();
                        inner.cache.put_document(&key, &payload);
                        payload
                    })
                    .collect();
                inner.cache.put_query(spec, &payloads);
                payloads
            }
            Err(e) => {
                self.note_failure(AccessError::from(e), "query_documents");
                inner.cache.get_query(spec).unwrap_or_default()
            }
        }
    }

    fn note_failure(&self, error: AccessError, operation: &str) {
        if error.is_transport_failure() {
            self.inner.meter.record_failure();
        }
        warn!(operation = %operation, error = %error, "Remote read failed, falling back to cache");
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Queue a set of the whole document (or a merge with `options.merge`).
    pub fn set_document<T: Serialize>(
        &self,
        collection: &Collection<T>,
        id: &str,
        value: &T,
        options: WriteOptions,
    ) -> WriteStatus {
        let key = collection.doc(id);
        let payload = match serde_json::to_value(value) {
            Ok(Json::Object(payload)) => payload,
            Ok(other) => {
                warn!(document = %key, "Refusing to write non-object value: {}", other);
                return WriteStatus::Invalid;
            }
            Err(e) => {
                warn!(document = %key, error = %e, "Failed to serialize document");
                return WriteStatus::Invalid;
            }
        };
        self.enqueue_write(PendingOperation::set(key, payload, options))
    }

    /// Queue a partial update of an existing document.
    pub fn update_document<T>(&self, collection: &Collection<T>, id: &str, fields: Payload) -> WriteStatus {
        self.enqueue_write(PendingOperation::update(collection.doc(id), fields))
    }

    pub fn delete_document<T>(&self, collection: &Collection<T>, id: &str) -> WriteStatus {
        self.enqueue_write(PendingOperation::delete(collection.doc(id)))
    }

    fn enqueue_write(&self, op: PendingOperation) -> WriteStatus {
        let inner = &self.inner;
        let kind = op.meter_kind();

        if !inner.meter.admit(kind, 1) {
            debug!(document = %op.key, kind = %kind, "Write denied by usage meter");
            return WriteStatus::QuotaDenied;
        }

        let op = if op.kind == WriteKind::Delete {
            op
        } else {
            op.with_server_timestamp(inner.config.server_timestamp_field.clone())
        };
        let op = op.enqueued_at(inner.clock.now());

        self.apply_locally(&op);
        inner.coalescer.enqueue(op);
        WriteStatus::Queued
    }

    /// Reflect a queued write in the overlay and the cache.
    ///
    /// The server timestamp field gets the local time as a placeholder until
    /// the committed value is read back. A patch with no known base is only
    /// recorded; the cache is left alone.
    fn apply_locally(&self, op: &PendingOperation) {
        let inner = &self.inner;

        let value = {
            let mut overlay = lock_overlay(&inner.overlay);
            let base = match overlay.get(&op.key) {
                Some(entry) if entry.base_known => Some(entry.value.clone()),
                Some(_) => None,
                None => inner.cache.get_document(&op.key).map(Some),
            };
            let replaces = matches!(op.kind, WriteKind::Delete | WriteKind::Set { merge: false });

            let entry = overlay.entry(op.key.clone()).or_default();
            entry.pending += 1;
            match base {
                Some(base) => {
                    entry.value = apply_op(inner.clock.as_ref(), base, op);
                    entry.base_known = true;
                    Some(entry.value.clone())
                }
                None if replaces => {
                    entry.value = apply_op(inner.clock.as_ref(), None, op);
                    entry.base_known = true;
                    entry.patches.clear();
                    Some(entry.value.clone())
                }
                None => {
                    entry.patches.push(op.clone());
                    None
                }
            }
        };

        match value {
            Some(Some(payload)) => inner.cache.put_document(&op.key, &payload),
            Some(None) => inner.cache.remove_document(&op.key),
            None => debug!(document = %op.key, "Base unknown, holding patch until next read"),
        }
    }

    /// Commit every queued write now.
    pub async fn flush_pending_writes(&self) -> FlushOutcome {
        self.inner.coalescer.flush().await
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.coalescer.len()
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Watch one document.
    ///
    /// A document already watched is not subscribed twice: the callback joins
    /// the live listener and immediately receives its last value. When the
    /// meter refuses, the callback receives the cached value once and the
    /// returned handle is inert.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen_to_document<T, F>(&self, collection: &Collection<T>, id: &str, callback: F) -> SubscriptionHandle
    where
        T: DeserializeOwned + 'static,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let key = collection.doc(id);

        let callback: DocumentCallback = {
            let key = key.clone();
            Arc::new(move |payload: Option<Payload>| match payload {
                None => callback(None),
                Some(payload) => {
                    if let Some(value) = decode(&key, payload) {
                        callback(Some(value));
                    }
                }
            })
        };

        if let Some(handle) = inner.subscriptions.attach(&key, Arc::clone(&callback)) {
            return handle;
        }

        if !inner.meter.admit(OperationKind::Read, 1) {
            debug!(document = %key, "Subscription denied, serving cache");
            callback(inner.cache.get_document(&key));
            return SubscriptionHandle::noop();
        }

        inner.subscriptions.open(&key, callback)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.active_count()
    }

    /// Whether a live subscription currently backs this document.
    pub fn is_listening<T>(&self, collection: &Collection<T>, id: &str) -> bool {
        self.inner.subscriptions.is_active(&collection.doc(id))
    }

    // =========================================================================
    // Usage and lifecycle
    // =========================================================================

    pub fn usage_stats(&self) -> UsageStats {
        self.inner.meter.stats()
    }

    /// Start periodic maintenance. Calling it again while running is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(maintenance::spawn(
            Arc::downgrade(&self.inner),
            self.inner.config.maintenance_interval,
        ));
    }

    /// Stop maintenance and the flush timer and close every subscription.
    ///
    /// Queued writes stay queued.
    pub fn stop(&self) {
        let inner = &self.inner;
        if let Some(task) = inner
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        inner.coalescer.cancel_timer();
        let closed = inner.subscriptions.teardown_all();
        info!(subscriptions_closed = closed, pending_writes = inner.coalescer.len(), "Data access stopped");
    }

    /// Flush queued writes, then stop.
    pub async fn shutdown(&self) -> FlushOutcome {
        let outcome = self.flush_pending_writes().await;
        if !outcome.is_complete() {
            warn!(?outcome, "Shutting down with writes still queued");
        }
        self.stop();
        outcome
    }

    /// One maintenance pass: daily roll-over, idle subscription teardown,
    /// cache sweep and a retry of queued writes when the store looks healthy.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let inner = &self.inner;

        let rolled_over = inner.meter.roll_over_if_due();
        let subscriptions_closed = inner.subscriptions.sweep_idle(inner.config.subscription_idle);
        let cache_evicted = inner.cache.sweep();

        let flush = if !inner.coalescer.is_empty() && !inner.meter.is_in_backoff() {
            Some(inner.coalescer.flush().await)
        } else {
            None
        };

        MaintenanceReport {
            rolled_over,
            subscriptions_closed,
            cache_evicted,
            flush,
        }
    }
}

/// Release overlay entries whose writes have all committed.
fn settle_overlay(overlay: &Overlay, chunk: &[PendingOperation]) {
    let mut overlay = lock_overlay(overlay);
    for op in chunk {
        if let Some(entry) = overlay.get_mut(&op.key) {
            entry.pending = entry.pending.saturating_sub(1);
            if entry.pending == 0 {
                overlay.remove(&op.key);
            }
        }
    }
}

/// Apply one write to a known base.
///
/// An update of a missing document leaves it missing; the commit will fail.
fn apply_op(clock: &dyn Clock, base: Option<Payload>, op: &PendingOperation) -> Option<Payload> {
    let value = match op.kind {
        WriteKind::Delete => None,
        WriteKind::Set { merge: false } => Some(op.payload.clone().unwrap_or_default()),
        WriteKind::Set { merge: true } => {
            let mut merged = base.unwrap_or_default();
            if let Some(patch) = &op.payload {
                merge_payload(&mut merged, patch);
            }
            Some(merged)
        }
        WriteKind::Update => base.map(|mut merged| {
            if let Some(patch) = &op.payload {
                merge_payload(&mut merged, patch);
            }
            merged
        }),
    };

    value.map(|mut payload| {
        payload
            .entry(DOCUMENT_ID_FIELD.to_string())
            .or_insert_with(|| Json::String(op.key.doc_id().to_string()));
        if let Some(field) = &op.server_timestamp_field {
            payload.insert(field.clone(), Json::String(clock.now().to_rfc3339()));
        }
        payload
    })
}

fn replay(clock: &dyn Clock, base: Option<Payload>, patches: &[PendingOperation]) -> Option<Payload> {
    patches.iter().fold(base, |value, op| apply_op(clock, value, op))
}

fn decode<T: DeserializeOwned>(key: &DocKey, payload: Payload) -> Option<T> {
    match serde_json::from_value(Json::Object(payload)) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(document = %key, error = %e, "Document does not match the expected shape");
            None
        }
    }
}
