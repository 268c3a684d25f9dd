//! In-process [`DocumentStore`].
//!
//! Holds documents in a sorted map, applies commits atomically, evaluates
//! queries locally and pushes change notifications to listeners. Used for
//! local development and as the remote store in tests, where failure and
//! latency injection stand in for an unreliable network.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::debug;

use crmdata_models::{
    merge_payload, DocKey, Filter, FilterOp, Payload, PendingOperation, QuerySpec, SortDirection,
    WriteKind,
};

use crate::error::{FirestoreError, FirestoreResult};
use crate::transport::{
    DocumentStore, ListenEvent, RemoteDocument, RemoteListener, RemoteSnapshot, MAX_COMMIT_WRITES,
};

#[derive(Debug, Clone)]
struct StoredDocument {
    fields: Payload,
    version: u64,
}

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<DocKey, StoredDocument>,
    version: u64,
    commits: Vec<Vec<PendingOperation>>,
    commit_attempts: usize,
    failing_attempts: BTreeSet<usize>,
    fail_all_commits: bool,
    commit_delay: Option<Duration>,
    fail_reads: bool,
    get_calls: usize,
    query_calls: usize,
    listeners: HashMap<u64, (DocKey, mpsc::UnboundedSender<ListenEvent>)>,
    next_listener_id: u64,
    listens_opened: usize,
}

impl MemoryState {
    fn remote(&self, key: &DocKey) -> Option<RemoteDocument> {
        self.documents.get(key).map(|doc| RemoteDocument {
            id: key.doc_id().to_string(),
            fields: doc.fields.clone(),
            update_time: Some(doc.version.to_string()),
        })
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn notify(&mut self, key: &DocKey, event: ListenEvent) {
        self.listeners.retain(|_, (watched, tx)| {
            if *watched != *key {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }

    fn notify_current(&mut self, key: &DocKey) {
        let snapshot = ListenEvent::Snapshot(RemoteSnapshot {
            document: self.remote(key),
            has_pending_writes: false,
        });
        self.notify(key, snapshot);
    }
}

/// In-memory document store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Remote-side mutation (simulates other clients)
    // =========================================================================

    /// Store a document as if another client wrote it, notifying listeners.
    pub fn put_remote(&self, key: &DocKey, fields: Payload) {
        let mut state = self.lock();
        let version = state.next_version();
        state
            .documents
            .insert(key.clone(), StoredDocument { fields, version });
        state.notify_current(key);
    }

    /// Delete a document as if another client removed it.
    pub fn delete_remote(&self, key: &DocKey) {
        let mut state = self.lock();
        if state.documents.remove(key).is_some() {
            state.notify_current(key);
        }
    }

    /// Push a raw snapshot to the document's listeners without storing it.
    pub fn emit(&self, key: &DocKey, fields: Option<Payload>, has_pending_writes: bool) {
        let mut state = self.lock();
        let version = state.next_version();
        let snapshot = ListenEvent::Snapshot(RemoteSnapshot {
            document: fields.map(|fields| RemoteDocument {
                id: key.doc_id().to_string(),
                fields,
                update_time: Some(version.to_string()),
            }),
            has_pending_writes,
        });
        state.notify(key, snapshot);
    }

    /// Push a listener error to the document's listeners.
    pub fn emit_error(&self, key: &DocKey, message: impl Into<String>) {
        self.lock().notify(key, ListenEvent::Error(message.into()));
    }

    // =========================================================================
    // Failure and latency injection
    // =========================================================================

    /// Fail the `n`-th commit call (1-based, counting every call so far).
    pub fn fail_commit_attempt(&self, n: usize) {
        self.lock().failing_attempts.insert(n);
    }

    pub fn fail_next_commit(&self) {
        let mut state = self.lock();
        let next = state.commit_attempts + 1;
        state.failing_attempts.insert(next);
    }

    /// Fail every commit until switched off.
    pub fn set_fail_commits(&self, fail: bool) {
        self.lock().fail_all_commits = fail;
    }

    /// Hold each commit for `delay` before applying it.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.lock().commit_delay = delay;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn document(&self, key: &DocKey) -> Option<Payload> {
        self.lock().documents.get(key).map(|d| d.fields.clone())
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Successfully applied commits, in order.
    pub fn commits(&self) -> Vec<Vec<PendingOperation>> {
        self.lock().commits.clone()
    }

    pub fn commit_sizes(&self) -> Vec<usize> {
        self.lock().commits.iter().map(Vec::len).collect()
    }

    pub fn commit_attempts(&self) -> usize {
        self.lock().commit_attempts
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }

    pub fn listens_opened(&self) -> usize {
        self.lock().listens_opened
    }

    pub fn active_listeners(&self, key: &DocKey) -> usize {
        self.lock()
            .listeners
            .values()
            .filter(|(watched, tx)| watched == key && !tx.is_closed())
            .count()
    }

    fn injected_failure(operation: &str) -> FirestoreError {
        FirestoreError::ServerError(503, format!("{} unavailable (injected)", operation))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &DocKey) -> FirestoreResult<Option<RemoteDocument>> {
        let mut state = self.lock();
        state.get_calls += 1;
        if state.fail_reads {
            return Err(Self::injected_failure("get"));
        }
        Ok(state.remote(key))
    }

    async fn query(&self, spec: &QuerySpec) -> FirestoreResult<Vec<RemoteDocument>> {
        let mut state = self.lock();
        state.query_calls += 1;
        if state.fail_reads {
            return Err(Self::injected_failure("query"));
        }

        let mut matches: Vec<RemoteDocument> = state
            .documents
            .keys()
            .filter(|key| key.collection() == spec.collection())
            .filter_map(|key| state.remote(key))
            .filter(|doc| spec.filters().iter().all(|f| matches_filter(&doc.fields, f)))
            .filter(|doc| {
                spec.sort_fields()
                    .iter()
                    .all(|o| lookup(&doc.fields, &o.field).is_some())
            })
            .collect();

        matches.sort_by(|a, b| {
            for order in spec.sort_fields() {
                let ordering = compare_json(lookup(&a.fields, &order.field), lookup(&b.fields, &order.field));
                let ordering = match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });

        if let Some(limit) = spec.result_limit() {
            matches.truncate(limit as usize);
        }
        Ok(matches)
    }

    async fn commit(&self, writes: &[PendingOperation]) -> FirestoreResult<()> {
        let delay = {
            let mut state = self.lock();
            state.commit_attempts += 1;
            state.commit_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let attempt = state.commit_attempts;
        if state.fail_all_commits || state.failing_attempts.remove(&attempt) {
            debug!(attempt, writes = writes.len(), "Injected commit failure");
            return Err(Self::injected_failure("commit"));
        }
        if writes.len() > MAX_COMMIT_WRITES {
            return Err(FirestoreError::request_failed(format!(
                "{} writes exceed the {} write commit limit",
                writes.len(),
                MAX_COMMIT_WRITES
            )));
        }

        // Apply to a copy so a failing write leaves the store untouched.
        let mut documents = state.documents.clone();
        let mut touched = Vec::with_capacity(writes.len());
        for op in writes {
            apply_write(&mut documents, op, &mut state.version)?;
            touched.push(op.key.clone());
        }

        state.documents = documents;
        state.commits.push(writes.to_vec());
        for key in touched {
            state.notify_current(&key);
        }
        Ok(())
    }

    fn listen(&self, key: &DocKey) -> RemoteListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listens_opened += 1;

        let initial = ListenEvent::Snapshot(RemoteSnapshot {
            document: state.remote(key),
            has_pending_writes: false,
        });
        let _ = tx.send(initial);
        state.listeners.insert(id, (key.clone(), tx));

        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        RemoteListener::new(rx, move || {
            if let Some(state) = weak.upgrade() {
                state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .listeners
                    .remove(&id);
            }
        })
    }
}

fn apply_write(
    documents: &mut BTreeMap<DocKey, StoredDocument>,
    op: &PendingOperation,
    version: &mut u64,
) -> FirestoreResult<()> {
    *version += 1;
    let mut patch = op.payload.clone().unwrap_or_default();
    if let Some(field) = &op.server_timestamp_field {
        patch.insert(field.clone(), Json::String(Utc::now().to_rfc3339()));
    }

    match op.kind {
        WriteKind::Delete => {
            documents.remove(&op.key);
        }
        WriteKind::Set { merge: false } => {
            documents.insert(
                op.key.clone(),
                StoredDocument {
                    fields: patch,
                    version: *version,
                },
            );
        }
        WriteKind::Set { merge: true } => {
            let doc = documents.entry(op.key.clone()).or_insert(StoredDocument {
                fields: Payload::new(),
                version: *version,
            });
            merge_payload(&mut doc.fields, &patch);
            doc.version = *version;
        }
        WriteKind::Update => {
            let doc = documents
                .get_mut(&op.key)
                .ok_or_else(|| FirestoreError::not_found(op.key.path()))?;
            merge_payload(&mut doc.fields, &patch);
            doc.version = *version;
        }
    }
    Ok(())
}

/// Resolve a dotted field path inside a payload.
fn lookup<'a>(fields: &'a Payload, path: &str) -> Option<&'a Json> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn json_eq(a: &Json, b: &Json) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

/// Order values of the same type; values of different types are unordered.
fn compare_same_type(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::Bool(_) => 1,
        Json::Number(_) => 2,
        Json::String(_) => 3,
        Json::Array(_) => 4,
        Json::Object(_) => 5,
    }
}

fn compare_json(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_same_type(x, y)
            .unwrap_or_else(|| type_rank(x).cmp(&type_rank(y))),
    }
}

fn matches_filter(fields: &Payload, filter: &Filter) -> bool {
    let Some(actual) = lookup(fields, &filter.field) else {
        return false;
    };
    let expected = &filter.value;
    let list = || expected.as_array().map(Vec::as_slice).unwrap_or(&[]);

    match filter.op {
        FilterOp::Equal => json_eq(actual, expected),
        FilterOp::NotEqual => !json_eq(actual, expected),
        FilterOp::LessThan => compare_same_type(actual, expected) == Some(Ordering::Less),
        FilterOp::LessThanOrEqual => matches!(
            compare_same_type(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::GreaterThan => compare_same_type(actual, expected) == Some(Ordering::Greater),
        FilterOp::GreaterThanOrEqual => matches!(
            compare_same_type(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::ArrayContains => actual
            .as_array()
            .is_some_and(|items| items.iter().any(|v| json_eq(v, expected))),
        FilterOp::In => list().iter().any(|v| json_eq(actual, v)),
        FilterOp::NotIn => !list().iter().any(|v| json_eq(actual, v)),
        FilterOp::ArrayContainsAny => actual
            .as_array()
            .is_some_and(|items| items.iter().any(|v| list().iter().any(|e| json_eq(v, e)))),
    }
}
