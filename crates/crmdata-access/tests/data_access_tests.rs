//! End-to-end behavior of the data-access façade over an in-memory document store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crmdata_access::{AccessConfig, DataAccess, FlushOutcome, ManualClock, QuotaLimits, WriteStatus};
use crmdata_firestore::MemoryDocumentStore;
use crmdata_models::{Collection, FilterOp, Payload, WriteOptions};
use crmdata_storage::{FileKvStore, MemoryKvStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Lead {
    id: String,
    name: String,
    stage: String,
}

fn lead(id: &str, name: &str, stage: &str) -> Lead {
    Lead {
        id: id.to_string(),
        name: name.to_string(),
        stage: stage.to_string(),
    }
}

fn fields(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn leads() -> Collection<Lead> {
    Collection::new("leads")
}

struct Harness {
    access: DataAccess,
    store: MemoryDocumentStore,
    kv: Arc<MemoryKvStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(AccessConfig::default())
    }

    fn with_config(config: AccessConfig) -> Self {
        let store = MemoryDocumentStore::new();
        let kv = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let access = DataAccess::with_clock(config, Arc::new(store.clone()), kv.clone(), clock.clone());
        Self {
            access,
            store,
            kv,
            clock,
        }
    }

    fn seed(&self, id: &str, name: &str, stage: &str) {
        self.store
            .put_remote(&leads().doc(id), fields(json!({"name": name, "stage": stage})));
    }
}

/// Let spawned listener tasks drain their channels.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

type Seen = Arc<Mutex<Vec<Option<Lead>>>>;

fn recorder() -> (Seen, impl Fn(Option<Lead>) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value| sink.lock().unwrap().push(value))
}

// =============================================================================
// Metering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_usage_counts_every_operation() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");
    h.seed("l2", "Grace", "new");
    h.seed("l3", "Linus", "new");

    let one = h.access.get_document(&leads(), "l1").await;
    assert_eq!(one, Some(lead("l1", "Ada", "new")));

    let query = leads().query().filter("stage", FilterOp::Equal, "new").order_by("name");
    let found = h.access.query_documents(&query).await;
    assert_eq!(
        found.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
        vec!["l1", "l2", "l3"]
    );

    let status = h
        .access
        .set_document(&leads(), "l4", &lead("l4", "Barbara", "won"), WriteOptions::default());
    assert_eq!(status, WriteStatus::Queued);
    assert_eq!(h.access.delete_document(&leads(), "l2"), WriteStatus::Queued);

    let stats = h.access.usage_stats();
    assert_eq!(stats.reads, 4);
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.deletes, 1);
    assert!(!stats.in_backoff);
}

#[tokio::test(start_paused = true)]
async fn test_limit_is_advisory() {
    let h = Harness::with_config(AccessConfig {
        quota: QuotaLimits {
            reads: 2,
            writes: 2,
            deletes: 2,
        },
        ..AccessConfig::default()
    });
    h.seed("l1", "Ada", "new");

    for _ in 0..3 {
        assert!(h.access.get_document(&leads(), "l1").await.is_some());
    }
    assert_eq!(h.store.get_calls(), 3);
    assert_eq!(h.access.usage_stats().reads, 3);
}

#[tokio::test(start_paused = true)]
async fn test_hard_deny_after_repeated_failures_then_recover() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");
    assert!(h.access.get_document(&leads(), "l1").await.is_some());

    h.store.set_fail_reads(true);
    for _ in 0..5 {
        // Failed reads fall back to the cached copy.
        assert_eq!(
            h.access.get_document(&leads(), "l1").await,
            Some(lead("l1", "Ada", "new"))
        );
    }
    assert_eq!(h.store.get_calls(), 6);

    let stats = h.access.usage_stats();
    assert!(stats.in_backoff);
    assert_eq!(stats.backoff_level, 5);

    // Denied: served from cache without touching the store.
    assert!(h.access.get_document(&leads(), "l1").await.is_some());
    assert_eq!(h.store.get_calls(), 6);
    assert_eq!(h.access.usage_stats().reads, 6);

    let status = h
        .access
        .set_document(&leads(), "l2", &lead("l2", "Grace", "new"), WriteOptions::default());
    assert_eq!(status, WriteStatus::QuotaDenied);
    assert_eq!(h.access.pending_writes(), 0);

    // 1.5^5 s is about 7.6 s.
    tokio::time::advance(Duration::from_secs(8)).await;
    h.store.set_fail_reads(false);
    assert!(h.access.get_document(&leads(), "l1").await.is_some());
    assert_eq!(h.store.get_calls(), 7);

    let stats = h.access.usage_stats();
    assert!(!stats.in_backoff);
    assert_eq!(stats.backoff_level, 0);
}

#[tokio::test(start_paused = true)]
async fn test_daily_reset_and_restart() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");
    h.access.get_document(&leads(), "l1").await;
    h.access.get_document(&leads(), "l1").await;

    let restarted = DataAccess::with_clock(
        AccessConfig::default(),
        Arc::new(h.store.clone()),
        h.kv.clone(),
        h.clock.clone(),
    );
    assert_eq!(restarted.usage_stats().reads, 2);

    h.clock.advance(Duration::from_secs(24 * 60 * 60));
    let report = h.access.run_maintenance().await;
    assert!(report.rolled_over);
    assert_eq!(h.access.usage_stats().reads, 0);
}

#[tokio::test(start_paused = true)]
async fn test_usage_and_cache_survive_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryDocumentStore::new();
    store.put_remote(&leads().doc("l1"), fields(json!({"name": "Ada", "stage": "new"})));
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));

    {
        let kv = Arc::new(FileKvStore::open(dir.path()).unwrap());
        let access = DataAccess::with_clock(AccessConfig::default(), Arc::new(store.clone()), kv, clock.clone());
        assert!(access.get_document(&leads(), "l1").await.is_some());
    }

    store.set_fail_reads(true);
    let kv = Arc::new(FileKvStore::open(dir.path()).unwrap());
    let access = DataAccess::with_clock(AccessConfig::default(), Arc::new(store.clone()), kv, clock);
    assert_eq!(access.usage_stats().reads, 1);
    assert_eq!(
        access.get_document(&leads(), "l1").await,
        Some(lead("l1", "Ada", "new"))
    );
}

// =============================================================================
// Cache fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_falls_back_to_cache_until_ttl() {
    let h = Harness::with_config(AccessConfig {
        cache_ttl: Duration::from_secs(60),
        ..AccessConfig::default()
    });
    h.seed("l1", "Ada", "new");
    assert!(h.access.get_document(&leads(), "l1").await.is_some());

    h.store.set_fail_reads(true);
    h.clock.advance(Duration::from_secs(30));
    assert_eq!(
        h.access.get_document(&leads(), "l1").await,
        Some(lead("l1", "Ada", "new"))
    );

    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.access.get_document(&leads(), "l1").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_query_falls_back_to_cached_result() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");
    h.seed("l2", "Grace", "won");

    let query = leads().query().filter("stage", FilterOp::Equal, "won");
    assert_eq!(h.access.query_documents(&query).await.len(), 1);

    h.store.set_fail_reads(true);
    let cached = h.access.query_documents(&query).await;
    assert_eq!(cached, vec![lead("l2", "Grace", "won")]);

    let uncached = leads().query().filter("stage", FilterOp::Equal, "lost");
    assert!(h.access.query_documents(&uncached).await.is_empty());
}

// =============================================================================
// Writes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pending_write_is_read_locally() {
    let h = Harness::new();
    h.access
        .set_document(&leads(), "l1", &lead("l1", "Ada", "new"), WriteOptions::default());

    assert_eq!(
        h.access.get_document(&leads(), "l1").await,
        Some(lead("l1", "Ada", "new"))
    );
    assert_eq!(h.store.get_calls(), 0);
    assert_eq!(h.access.usage_stats().reads, 0);

    let mut patch = Payload::new();
    patch.insert("stage".into(), json!("qualified"));
    assert_eq!(h.access.update_document(&leads(), "l1", patch), WriteStatus::Queued);
    assert_eq!(
        h.access.get_document(&leads(), "l1").await,
        Some(lead("l1", "Ada", "qualified"))
    );

    h.access.flush_pending_writes().await;
    let stored = h.store.document(&leads().doc("l1")).unwrap();
    assert_eq!(stored["stage"], json!("qualified"));
    assert!(stored["updatedAt"].is_string());

    assert!(h.access.get_document(&leads(), "l1").await.is_some());
    assert_eq!(h.store.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_writes_flush_after_debounce() {
    let h = Harness::new();
    for i in 0..3 {
        let id = format!("l{}", i);
        h.access
            .set_document(&leads(), &id, &lead(&id, "Ada", "new"), WriteOptions::default());
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(h.store.commit_attempts(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.store.commit_sizes(), vec![3]);
    assert_eq!(h.access.pending_writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_large_flush_is_chunked() {
    let h = Harness::new();
    for i in 0..1200 {
        let id = format!("l{:04}", i);
        h.access
            .set_document(&leads(), &id, &lead(&id, "Ada", "new"), WriteOptions::default());
    }

    let outcome = h.access.flush_pending_writes().await;
    assert_eq!(
        outcome,
        FlushOutcome::Completed {
            batches: 3,
            operations: 1200
        }
    );
    assert_eq!(h.store.commit_sizes(), vec![500, 500, 200]);
    assert_eq!(h.store.document_count(), 1200);
}

#[tokio::test(start_paused = true)]
async fn test_failed_chunk_keeps_rest_queued() {
    let h = Harness::new();
    for i in 0..1200 {
        let id = format!("l{:04}", i);
        h.access
            .set_document(&leads(), &id, &lead(&id, "Ada", "new"), WriteOptions::default());
    }
    h.store.fail_commit_attempt(2);

    let outcome = h.access.flush_pending_writes().await;
    assert_eq!(
        outcome,
        FlushOutcome::Partial {
            batches: 1,
            operations: 500,
            remaining: 700
        }
    );
    assert_eq!(h.access.pending_writes(), 700);
    assert_eq!(h.store.document_count(), 500);

    // Still served from the local overlay.
    assert_eq!(
        h.access.get_document(&leads(), "l0900").await,
        Some(lead("l0900", "Ada", "new"))
    );
    assert_eq!(h.store.get_calls(), 0);

    assert!(h.access.flush_pending_writes().await.is_complete());
    assert_eq!(h.store.document_count(), 1200);
}

#[tokio::test(start_paused = true)]
async fn test_update_of_missing_document_stays_queued() {
    let h = Harness::new();
    let mut patch = Payload::new();
    patch.insert("stage".into(), json!("won"));
    h.access.update_document(&leads(), "ghost", patch);

    let outcome = h.access.flush_pending_writes().await;
    assert!(!outcome.is_complete());
    assert_eq!(h.access.pending_writes(), 1);
    assert_eq!(h.access.usage_stats().backoff_level, 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_without_cached_copy_merges_over_remote() {
    let h = Harness::new();
    h.seed("l9", "Ada", "new");

    let mut patch = Payload::new();
    patch.insert("stage".into(), json!("won"));
    assert_eq!(h.access.update_document(&leads(), "l9", patch), WriteStatus::Queued);

    assert_eq!(
        h.access.get_document(&leads(), "l9").await,
        Some(lead("l9", "Ada", "won"))
    );
    assert_eq!(h.store.get_calls(), 1);

    // Resolved now, so answered locally.
    assert_eq!(
        h.access.get_document(&leads(), "l9").await,
        Some(lead("l9", "Ada", "won"))
    );
    assert_eq!(h.store.get_calls(), 1);

    assert!(h.access.flush_pending_writes().await.is_complete());
    let stored = h.store.document(&leads().doc("l9")).unwrap();
    assert_eq!(stored["name"], json!("Ada"));
    assert_eq!(stored["stage"], json!("won"));

    h.store.set_fail_reads(true);
    assert_eq!(
        h.access.get_document(&leads(), "l9").await,
        Some(lead("l9", "Ada", "won"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_update_is_not_cached() {
    let h = Harness::new();
    h.seed("l9", "Ada", "new");

    let mut patch = Payload::new();
    patch.insert("stage".into(), json!("won"));
    h.access.update_document(&leads(), "l9", patch);

    // No base to merge over: nothing rather than a partial document.
    h.store.set_fail_reads(true);
    assert_eq!(h.access.get_document(&leads(), "l9").await, None);

    assert!(h.access.flush_pending_writes().await.is_complete());
    assert_eq!(h.access.get_document(&leads(), "l9").await, None);

    h.store.set_fail_reads(false);
    assert_eq!(
        h.access.get_document(&leads(), "l9").await,
        Some(lead("l9", "Ada", "won"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_merge_set_over_unknown_base_keeps_remote_fields() {
    let h = Harness::new();
    h.seed("l9", "Ada", "new");

    let raw: Collection<Payload> = Collection::new("leads");
    let mut patch = Payload::new();
    patch.insert("stage".into(), json!("qualified"));
    h.access.set_document(&raw, "l9", &patch, WriteOptions::merge());
    let mut patch = Payload::new();
    patch.insert("stage".into(), json!("won"));
    h.access.update_document(&raw, "l9", patch);

    let value = h.access.get_document(&raw, "l9").await.unwrap();
    assert_eq!(value["name"], json!("Ada"));
    assert_eq!(value["stage"], json!("won"));
    assert!(value["updatedAt"].is_string());
}

#[tokio::test(start_paused = true)]
async fn test_non_object_value_is_invalid() {
    let h = Harness::new();
    let raw: Collection<serde_json::Value> = Collection::new("leads");
    let status = h.access.set_document(&raw, "l1", &json!(5), WriteOptions::default());
    assert_eq!(status, WriteStatus::Invalid);
    assert_eq!(h.access.pending_writes(), 0);
    assert_eq!(h.access.usage_stats().writes, 0);
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_listener_shares_subscription() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");

    let (first_seen, first) = recorder();
    let first_handle = h.access.listen_to_document(&leads(), "l1", first);
    settle().await;

    let (second_seen, second) = recorder();
    let second_handle = h.access.listen_to_document(&leads(), "l1", second);
    assert_eq!(h.store.listens_opened(), 1);
    assert_eq!(h.access.active_subscriptions(), 1);
    assert_eq!(*second_seen.lock().unwrap(), vec![Some(lead("l1", "Ada", "new"))]);

    h.seed("l1", "Ada", "won");
    settle().await;
    assert_eq!(first_seen.lock().unwrap().len(), 2);
    assert_eq!(second_seen.lock().unwrap().last(), Some(&Some(lead("l1", "Ada", "won"))));

    first_handle.unsubscribe();
    settle().await;
    assert_eq!(h.access.active_subscriptions(), 1);
    assert_eq!(h.store.active_listeners(&leads().doc("l1")), 1);

    second_handle.unsubscribe();
    settle().await;
    assert_eq!(h.access.active_subscriptions(), 0);
    assert_eq!(h.store.active_listeners(&leads().doc("l1")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_and_own_pending_notifications_are_dropped() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");
    let key = leads().doc("l1");

    let (seen, callback) = recorder();
    let _handle = h.access.listen_to_document(&leads(), "l1", callback);
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    h.store.emit(&key, Some(fields(json!({"name": "Ada", "stage": "new"}))), false);
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    h.store.emit(&key, Some(fields(json!({"name": "Ada", "stage": "lost"}))), true);
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    h.store.emit(&key, Some(fields(json!({"name": "Ada", "stage": "won"}))), false);
    settle().await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(lead("l1", "Ada", "new")), Some(lead("l1", "Ada", "won"))]
    );
    // Delivered notifications count as reads: one for the open, two snapshots.
    assert_eq!(h.access.usage_stats().reads, 3);
}

#[tokio::test(start_paused = true)]
async fn test_listener_error_serves_cached_value() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");

    let (seen, callback) = recorder();
    let _handle = h.access.listen_to_document(&leads(), "l1", callback);
    settle().await;

    h.store.emit_error(&leads().doc("l1"), "stream reset");
    settle().await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(lead("l1", "Ada", "new")), Some(lead("l1", "Ada", "new"))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_denied_listen_delivers_cache_once() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");
    h.access.get_document(&leads(), "l1").await;

    h.store.set_fail_reads(true);
    for _ in 0..5 {
        h.access.get_document(&leads(), "l1").await;
    }

    let (seen, callback) = recorder();
    let handle = h.access.listen_to_document(&leads(), "l1", callback);
    assert!(handle.is_noop());
    assert_eq!(*seen.lock().unwrap(), vec![Some(lead("l1", "Ada", "new"))]);
    assert_eq!(h.store.listens_opened(), 0);
    assert_eq!(h.access.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_is_idempotent() {
    let h = Harness::new();
    h.seed("l1", "Ada", "new");

    let (_seen, callback) = recorder();
    let handle = h.access.listen_to_document(&leads(), "l1", callback);
    let copy = handle.clone();
    settle().await;

    handle.unsubscribe();
    handle.unsubscribe();
    copy.unsubscribe();
    settle().await;
    assert_eq!(h.access.active_subscriptions(), 0);
    assert_eq!(h.store.active_listeners(&leads().doc("l1")), 0);
}

// =============================================================================
// Maintenance and lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_maintenance_closes_idle_subscriptions() {
    let h = Harness::with_config(AccessConfig {
        subscription_idle: Duration::from_secs(60),
        ..AccessConfig::default()
    });
    h.seed("l1", "Ada", "new");
    h.seed("l2", "Grace", "new");

    let (_a, first) = recorder();
    let (_b, second) = recorder();
    let _h1 = h.access.listen_to_document(&leads(), "l1", first);
    settle().await;
    h.clock.advance(Duration::from_secs(45));
    let _h2 = h.access.listen_to_document(&leads(), "l2", second);
    settle().await;

    h.clock.advance(Duration::from_secs(30));
    let report = h.access.run_maintenance().await;
    assert_eq!(report.subscriptions_closed, 1);
    assert_eq!(h.access.active_subscriptions(), 1);
    assert!(report.flush.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_background_maintenance_retries_failed_flush() {
    let h = Harness::with_config(AccessConfig {
        maintenance_interval: Duration::from_secs(60),
        ..AccessConfig::default()
    });
    h.access.start();
    h.access.start();

    h.store.set_fail_commits(true);
    h.access
        .set_document(&leads(), "l1", &lead("l1", "Ada", "new"), WriteOptions::default());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.store.commit_attempts(), 1);
    assert_eq!(h.access.pending_writes(), 1);

    h.store.set_fail_commits(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.access.pending_writes(), 0);
    assert_eq!(h.store.document_count(), 1);

    h.access.stop();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_and_closes() {
    let h = Harness::new();
    h.seed("l0", "Ada", "new");
    let (_seen, callback) = recorder();
    let _handle = h.access.listen_to_document(&leads(), "l0", callback);
    settle().await;

    for i in 1..4 {
        let id = format!("l{}", i);
        h.access
            .set_document(&leads(), &id, &lead(&id, "Grace", "new"), WriteOptions::default());
    }

    let outcome = h.access.shutdown().await;
    assert_eq!(
        outcome,
        FlushOutcome::Completed {
            batches: 1,
            operations: 3
        }
    );
    assert_eq!(h.store.document_count(), 4);
    assert_eq!(h.access.active_subscriptions(), 0);
}
