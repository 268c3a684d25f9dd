//! The document-store transport seam.
//!
//! The data-access layer talks to the remote store only through
//! [`DocumentStore`]: point read, structured query, atomic grouped commit and
//! a change subscription. [`crate::FirestoreClient`] implements it over the
//! REST API; [`crate::MemoryDocumentStore`] implements it in process.

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crmdata_models::{DocKey, Payload, PendingOperation, QuerySpec};

use crate::error::FirestoreResult;

/// Field under which document ids are exposed in payloads.
pub const DOCUMENT_ID_FIELD: &str = "id";

/// Maximum number of writes in one atomic commit.
pub const MAX_COMMIT_WRITES: usize = 500;

/// A document as returned by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub fields: Payload,
    pub update_time: Option<String>,
}

impl RemoteDocument {
    /// Fields with the document id injected under [`DOCUMENT_ID_FIELD`].
    ///
    /// A stored `id` field takes precedence over the resource name.
    pub fn into_payload(self) -> Payload {
        let mut fields = self.fields;
        fields
            .entry(DOCUMENT_ID_FIELD.to_string())
            .or_insert(Json::String(self.id));
        fields
    }
}

/// One change notification for a watched document.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    /// Current document, `None` if it does not exist.
    pub document: Option<RemoteDocument>,
    /// The change comes from this client's own write that the server has not
    /// acknowledged yet.
    pub has_pending_writes: bool,
}

/// Event delivered by a remote listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenEvent {
    Snapshot(RemoteSnapshot),
    Error(String),
}

/// Receiving end of a change subscription.
///
/// Dropping the listener (or calling [`RemoteListener::cancel`]) detaches it
/// from the remote store.
pub struct RemoteListener {
    events: mpsc::UnboundedReceiver<ListenEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl RemoteListener {
    pub fn new(
        events: mpsc::UnboundedReceiver<ListenEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next event, or `None` once the remote side has closed.
    pub async fn next_event(&mut self) -> Option<ListenEvent> {
        self.events.recv().await
    }

    /// Detach from the remote store. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.events.close();
    }
}

impl Drop for RemoteListener {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RemoteListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteListener")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document.
    async fn get(&self, key: &DocKey) -> FirestoreResult<Option<RemoteDocument>>;

    /// Run a filtered, sorted, limited query.
    async fn query(&self, spec: &QuerySpec) -> FirestoreResult<Vec<RemoteDocument>>;

    /// Apply `writes` atomically: all of them or none.
    ///
    /// At most [`MAX_COMMIT_WRITES`] writes per call.
    async fn commit(&self, writes: &[PendingOperation]) -> FirestoreResult<()>;

    /// Open a change subscription on one document.
    ///
    /// Must be called from within a tokio runtime.
    fn listen(&self, key: &DocKey) -> RemoteListener;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_into_payload_injects_id() {
        let doc = RemoteDocument {
            id: "l1".into(),
            fields: json!({"stage": "new"}).as_object().cloned().unwrap(),
            update_time: None,
        };
        assert_eq!(Json::Object(doc.into_payload()), json!({"id": "l1", "stage": "new"}));
    }

    #[test]
    fn test_cancel_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&calls);
        let mut listener = RemoteListener::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listener.cancel();
        listener.cancel();
        drop(listener);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
