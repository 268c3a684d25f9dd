//! Deduplicated live document subscriptions.
//!
//! Each watched document has at most one remote listener, shared by every
//! callback registered for it. Notifications for this client's own
//! unacknowledged writes are ignored, and a notification whose payload
//! hashes the same as the last delivered one is suppressed. Delivered
//! values are written through to the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crmdata_firestore::{DocumentStore, ListenEvent, RemoteListener};
use crmdata_models::{DocKey, OperationKind, Payload};

use crate::cache::LocalCache;
use crate::clock::Clock;
use crate::meter::UsageMeter;
use crate::metrics::set_active_subscriptions;

/// Receives the current document value, `None` if it does not exist.
pub type DocumentCallback = Arc<dyn Fn(Option<Payload>) + Send + Sync>;

/// SHA-256 of the serialized payload, the change-detection fingerprint.
pub fn payload_hash(payload: Option<&Payload>) -> String {
    let serialized = serde_json::to_string(&payload).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

struct Subscriber {
    id: u64,
    callback: DocumentCallback,
}

struct LiveSubscription {
    task: Option<JoinHandle<()>>,
    subscribers: Vec<Subscriber>,
    last_touched_at: DateTime<Utc>,
    last_seen_hash: Option<String>,
    last_value: Option<Option<Payload>>,
}

impl LiveSubscription {
    fn callbacks(&self) -> Vec<DocumentCallback> {
        self.subscribers.iter().map(|s| Arc::clone(&s.callback)).collect()
    }

    fn teardown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<DocKey, LiveSubscription>,
    next_id: u64,
}

/// Registry of live subscriptions, one per document.
pub struct SubscriptionRegistry {
    store: Arc<dyn DocumentStore>,
    cache: Arc<LocalCache>,
    meter: Arc<UsageMeter>,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<LocalCache>,
        meter: Arc<UsageMeter>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            meter,
            clock,
            state: Mutex::new(RegistryState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join an existing subscription on `key`, if there is one.
    ///
    /// The callback immediately receives the last delivered value.
    pub fn attach(self: &Arc<Self>, key: &DocKey, callback: DocumentCallback) -> Option<SubscriptionHandle> {
        let (handle, last_value) = {
            let mut state = self.lock();
            let id = state.next_id;
            let now = self.clock.now();
            let entry = state.entries.get_mut(key)?;
            entry.last_touched_at = now;
            entry.subscribers.push(Subscriber {
                id,
                callback: Arc::clone(&callback),
            });
            let last_value = entry.last_value.clone();
            state.next_id += 1;
            (self.handle(key, id), last_value)
        };

        debug!(document = %key, "Joined existing subscription");
        if let Some(value) = last_value {
            callback(value);
        }
        Some(handle)
    }

    /// Open the remote listener for `key`, or join it if another caller
    /// opened it first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(self: &Arc<Self>, key: &DocKey, callback: DocumentCallback) -> SubscriptionHandle {
        let mut state = self.lock();
        if state.entries.contains_key(key) {
            drop(state);
            if let Some(handle) = self.attach(key, Arc::clone(&callback)) {
                return handle;
            }
            state = self.lock();
        }

        let id = state.next_id;
        state.next_id += 1;

        let listener = self.store.listen(key);
        let task = tokio::spawn(
            run_listener(Arc::downgrade(self), key.clone(), listener)
                .instrument(info_span!("document_listener", document = %key)),
        );

        state.entries.insert(
            key.clone(),
            LiveSubscription {
                task: Some(task),
                subscribers: vec![Subscriber { id, callback }],
                last_touched_at: self.clock.now(),
                last_seen_hash: None,
                last_value: None,
            },
        );
        set_active_subscriptions(state.entries.len());
        info!(document = %key, "Opened document subscription");

        self.handle(key, id)
    }

    fn handle(self: &Arc<Self>, key: &DocKey, subscriber_id: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            inner: Some(Arc::new(HandleInner {
                registry: Arc::downgrade(self),
                key: key.clone(),
                subscriber_id,
                active: AtomicBool::new(true),
            })),
        }
    }

    fn handle_event(&self, key: &DocKey, event: ListenEvent) {
        match event {
            ListenEvent::Snapshot(snapshot) if snapshot.has_pending_writes => {
                debug!(document = %key, "Ignoring notification for own pending write");
            }
            ListenEvent::Snapshot(snapshot) => {
                let value = snapshot.document.map(|d| d.into_payload());
                let hash = payload_hash(value.as_ref());

                let callbacks = {
                    let mut state = self.lock();
                    let now = self.clock.now();
                    let Some(entry) = state.entries.get_mut(key) else {
                        return;
                    };
                    if entry.last_seen_hash.as_deref() == Some(hash.as_str()) {
                        debug!(document = %key, "Suppressing unchanged notification");
                        return;
                    }
                    entry.last_seen_hash = Some(hash);
                    entry.last_value = Some(value.clone());
                    entry.last_touched_at = now;
                    entry.callbacks()
                };

                match &value {
                    Some(payload) => self.cache.put_document(key, payload),
                    None => self.cache.remove_document(key),
                }
                self.meter.record_usage(OperationKind::Read, 1);

                for callback in callbacks {
                    callback(value.clone());
                }
            }
            ListenEvent::Error(message) => {
                warn!(document = %key, error = %message, "Document listener error, serving cached value");
                let callbacks = match self.lock().entries.get(key) {
                    Some(entry) => entry.callbacks(),
                    None => return,
                };
                let cached = self.cache.get_document(key);
                for callback in callbacks {
                    callback(cached.clone());
                }
            }
        }
    }

    fn detach(&self, key: &DocKey, subscriber_id: u64) {
        let removed = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            entry.subscribers.retain(|s| s.id != subscriber_id);
            if !entry.subscribers.is_empty() {
                return;
            }
            let removed = state.entries.remove(key);
            set_active_subscriptions(state.entries.len());
            removed
        };

        if let Some(entry) = removed {
            entry.teardown();
            info!(document = %key, "Closed document subscription");
        }
    }

    /// Tear down subscriptions untouched for longer than `idle`.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let now = self.clock.now();
        let idle = chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX);

        let expired: Vec<(DocKey, LiveSubscription)> = {
            let mut state = self.lock();
            let keys: Vec<DocKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| now - entry.last_touched_at > idle)
                .map(|(key, _)| key.clone())
                .collect();
            let expired = keys
                .into_iter()
                .filter_map(|key| state.entries.remove(&key).map(|entry| (key, entry)))
                .collect();
            set_active_subscriptions(state.entries.len());
            expired
        };

        let count = expired.len();
        for (key, entry) in expired {
            debug!(document = %key, "Closing idle subscription");
            entry.teardown();
        }
        if count > 0 {
            info!(count, "Closed idle subscriptions");
        }
        count
    }

    /// Tear down every subscription.
    pub fn teardown_all(&self) -> usize {
        let entries: Vec<LiveSubscription> = {
            let mut state = self.lock();
            let drained = state.entries.drain().map(|(_, entry)| entry).collect();
            set_active_subscriptions(0);
            drained
        };
        let count = entries.len();
        entries.into_iter().for_each(LiveSubscription::teardown);
        count
    }

    pub fn active_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_active(&self, key: &DocKey) -> bool {
        self.lock().entries.contains_key(key)
    }
}

async fn run_listener(registry: Weak<SubscriptionRegistry>, key: DocKey, mut listener: RemoteListener) {
    while let Some(event) = listener.next_event().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_event(&key, event);
    }
    debug!(document = %key, "Document listener finished");
}

struct HandleInner {
    registry: Weak<SubscriptionRegistry>,
    key: DocKey,
    subscriber_id: u64,
    active: AtomicBool,
}

/// Handle returned by a subscribe call. Clones share the same registration.
#[derive(Clone, Default)]
pub struct SubscriptionHandle {
    inner: Option<Arc<HandleInner>>,
}

impl SubscriptionHandle {
    /// A handle with nothing behind it.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Stop receiving updates. Idempotent.
    ///
    /// The remote listener closes once its last subscriber leaves.
    pub fn unsubscribe(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if !inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = inner.registry.upgrade() {
            registry.detach(&inner.key, inner.subscriber_id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("SubscriptionHandle")
                .field("document", &inner.key)
                .field("active", &inner.active.load(Ordering::SeqCst))
                .finish(),
            None => f.write_str("SubscriptionHandle(noop)"),
        }
    }
}
