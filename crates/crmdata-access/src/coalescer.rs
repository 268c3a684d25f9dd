//! Write coalescing into grouped atomic commits.
//!
//! Writes are queued in order and flushed either on demand or by a debounced
//! timer armed on enqueue: each enqueue pushes the deadline forward instead of
//! arming a second timer. A flush commits the queue front-to-back in chunks
//! of at most `max_batch` writes. Committed chunks leave the queue; the first
//! failing chunk and everything behind it stay queued for the next cycle.
//!
//! Flushes are serialized: at most one is in flight, and writes enqueued
//! while it runs are picked up by the next cycle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crmdata_firestore::DocumentStore;
use crmdata_models::PendingOperation;

use crate::meter::UsageMeter;
use crate::metrics::{record_flush_batch, set_queue_depth};

/// Called with every chunk right after it commits.
pub type CommitHook = Box<dyn Fn(&[PendingOperation]) + Send + Sync>;

/// What a flush achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Empty,
    /// Every queued write committed.
    Completed { batches: usize, operations: usize },
    /// A chunk failed; it and the writes behind it are still queued.
    Partial {
        batches: usize,
        operations: usize,
        remaining: usize,
    },
}

impl FlushOutcome {
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::Partial { .. })
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<PendingOperation>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

struct CoalescerInner {
    store: Arc<dyn DocumentStore>,
    meter: Arc<UsageMeter>,
    max_batch: usize,
    delay: Duration,
    state: Mutex<QueueState>,
    flight: tokio::sync::Mutex<()>,
    on_commit: Option<CommitHook>,
}

/// Ordered write queue with debounced grouped commits.
#[derive(Clone)]
pub struct BatchCoalescer {
    inner: Arc<CoalescerInner>,
}

impl BatchCoalescer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        meter: Arc<UsageMeter>,
        max_batch: usize,
        delay: Duration,
        on_commit: Option<CommitHook>,
    ) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                store,
                meter,
                max_batch: max_batch.clamp(1, crmdata_firestore::MAX_COMMIT_WRITES),
                delay,
                state: Mutex::new(QueueState::default()),
                flight: tokio::sync::Mutex::new(()),
                on_commit,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a write and push the flush deadline out by the debounce delay.
    ///
    /// Outside a tokio runtime the write is queued without a timer and waits
    /// for an explicit flush.
    pub fn enqueue(&self, op: PendingOperation) {
        let mut state = self.lock();
        debug!(document = %op.key, kind = ?op.kind, "Queued write");
        state.queue.push_back(op);
        state.deadline = Some(Instant::now() + self.inner.delay);
        set_queue_depth(state.queue.len());

        let timer_running = state.timer.as_ref().is_some_and(|t| !t.is_finished());
        if !timer_running {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let coalescer = self.clone();
                state.timer = Some(handle.spawn(async move { coalescer.run_timer().await }));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Copy of the queued writes, front first.
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Whether a debounce timer is armed.
    pub fn has_timer(&self) -> bool {
        self.lock().timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Disarm the debounce timer, leaving the queue intact.
    pub fn cancel_timer(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.deadline = None;
    }

    async fn run_timer(&self) {
        loop {
            let deadline = match self.lock().deadline {
                Some(deadline) => deadline,
                None => return,
            };
            tokio::time::sleep_until(deadline).await;

            let due = {
                let mut state = self.lock();
                match state.deadline {
                    Some(current) if current > Instant::now() => false,
                    _ => {
                        // Detach so the flush below does not abort this task.
                        state.timer = None;
                        state.deadline = None;
                        true
                    }
                }
            };
            if !due {
                continue;
            }

            let outcome = self.flush().await;
            debug!(?outcome, "Debounced flush finished");
            return;
        }
    }

    /// Commit everything queued at this point, in order.
    pub async fn flush(&self) -> FlushOutcome {
        self.cancel_timer();
        let _flight = self.inner.flight.lock().await;

        let mut batches = 0;
        let mut operations = 0;
        // Writes enqueued from here on belong to the next cycle.
        let mut budget = self.len();

        while budget > 0 {
            let chunk: Vec<PendingOperation> = {
                let state = self.lock();
                let size = self.inner.max_batch.min(budget);
                state.queue.iter().take(size).cloned().collect()
            };
            if chunk.is_empty() {
                break;
            }

            let span = tracing::info_span!("flush_batch", batch = batches + 1, size = chunk.len());
            match self.inner.store.commit(&chunk).instrument(span).await {
                Ok(()) => {
                    {
                        let mut state = self.lock();
                        state.queue.drain(..chunk.len());
                        set_queue_depth(state.queue.len());
                    }
                    self.inner.meter.record_success();
                    record_flush_batch(true);
                    if let Some(hook) = &self.inner.on_commit {
                        hook(&chunk);
                    }
                    batches += 1;
                    operations += chunk.len();
                    budget -= chunk.len();
                }
                Err(e) => {
                    record_flush_batch(false);
                    if crmdata_firestore::retry::is_transport_failure(&e) {
                        self.inner.meter.record_failure();
                    }
                    let remaining = self.len();
                    warn!(
                        error = %e,
                        committed = operations,
                        remaining,
                        "Batch commit failed, keeping writes queued"
                    );
                    return FlushOutcome::Partial {
                        batches,
                        operations,
                        remaining,
                    };
                }
            }
        }

        if batches == 0 {
            return FlushOutcome::Empty;
        }
        info!(batches, operations, "Flushed pending writes");
        FlushOutcome::Completed {
            batches,
            operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QuotaLimits;
    use chrono::Utc;
    use crmdata_firestore::MemoryDocumentStore;
    use crmdata_models::DocKey;
    use crmdata_storage::MemoryKvStore;

    fn coalescer(store: &MemoryDocumentStore) -> BatchCoalescer {
        let meter = Arc::new(UsageMeter::new(
            QuotaLimits::default(),
            Arc::new(MemoryKvStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        BatchCoalescer::new(
            Arc::new(store.clone()),
            meter,
            500,
            Duration::from_secs(1),
            None,
        )
    }

    fn delete(i: usize) -> PendingOperation {
        PendingOperation::delete(DocKey::new("leads", format!("l{:04}", i)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_pushes_deadline_forward() {
        let store = MemoryDocumentStore::new();
        let coalescer = coalescer(&store);

        coalescer.enqueue(delete(0));
        tokio::time::sleep(Duration::from_millis(800)).await;
        coalescer.enqueue(delete(1));
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.commit_attempts(), 0);
        assert_eq!(coalescer.len(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.commit_sizes(), vec![2]);
        assert!(coalescer.is_empty());
        assert!(!coalescer.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_chunks_in_order() {
        let store = MemoryDocumentStore::new();
        let coalescer = coalescer(&store);
        for i in 0..1200 {
            coalescer.enqueue(delete(i));
        }

        let outcome = coalescer.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Completed {
                batches: 3,
                operations: 1200
            }
        );
        assert_eq!(store.commit_sizes(), vec![500, 500, 200]);
        let commits = store.commits();
        assert_eq!(commits[1][0].key.doc_id(), "l0500");
        assert!(coalescer.is_empty());
        assert!(!coalescer.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_and_rest_stay_queued() {
        let store = MemoryDocumentStore::new();
        let coalescer = coalescer(&store);
        for i in 0..1200 {
            coalescer.enqueue(delete(i));
        }
        store.fail_commit_attempt(2);

        let outcome = coalescer.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Partial {
                batches: 1,
                operations: 500,
                remaining: 700
            }
        );
        let pending = coalescer.pending();
        assert_eq!(pending.len(), 700);
        assert_eq!(pending[0].key.doc_id(), "l0500");
        assert_eq!(pending[699].key.doc_id(), "l1199");

        assert!(coalescer.flush().await.is_complete());
        assert_eq!(store.commit_sizes(), vec![500, 500, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush() {
        let store = MemoryDocumentStore::new();
        assert_eq!(coalescer(&store).flush().await, FlushOutcome::Empty);
        assert_eq!(store.commit_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_during_flush_waits_for_next_cycle() {
        let store = MemoryDocumentStore::new();
        store.set_commit_delay(Some(Duration::from_millis(500)));
        let coalescer = coalescer(&store);
        coalescer.enqueue(delete(0));

        let flushing = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        coalescer.enqueue(delete(1));

        let first = flushing.await.unwrap();
        assert_eq!(
            first,
            FlushOutcome::Completed {
                batches: 1,
                operations: 1
            }
        );
        assert_eq!(coalescer.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.commit_sizes(), vec![1, 1]);
    }
}
