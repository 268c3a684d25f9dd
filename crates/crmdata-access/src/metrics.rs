//! Data-access metrics.

use crmdata_models::{OperationKind, UsageStats};
use metrics::{counter, gauge};

/// Metric name constants for consistency.
pub mod names {
    /// Cache lookups that returned a fresh entry.
    pub const CACHE_HITS_TOTAL: &str = "crm_cache_hits_total";

    /// Cache lookups with no usable entry.
    pub const CACHE_MISSES_TOTAL: &str = "crm_cache_misses_total";

    /// Entries removed for age or corruption.
    pub const CACHE_EVICTIONS_TOTAL: &str = "crm_cache_evictions_total";

    /// Operations refused by the usage meter, by kind.
    pub const ADMISSIONS_DENIED_TOTAL: &str = "crm_admissions_denied_total";

    /// Commits sent by the batch coalescer.
    pub const FLUSH_BATCHES_TOTAL: &str = "crm_flush_batches_total";

    /// Commits that failed and left their writes queued.
    pub const FLUSH_FAILURES_TOTAL: &str = "crm_flush_failures_total";

    /// Writes waiting in the queue.
    pub const QUEUE_DEPTH: &str = "crm_queue_depth";

    /// Live remote subscriptions.
    pub const ACTIVE_SUBSCRIPTIONS: &str = "crm_active_subscriptions";

    /// Operations counted in the current daily window, by kind.
    pub const DAILY_USAGE: &str = "crm_daily_usage";

    /// Consecutive transport failures.
    pub const BACKOFF_LEVEL: &str = "crm_backoff_level";
}

pub fn record_cache_lookup(hit: bool) {
    if hit {
        counter!(names::CACHE_HITS_TOTAL).increment(1);
    } else {
        counter!(names::CACHE_MISSES_TOTAL).increment(1);
    }
}

pub fn record_cache_evictions(count: usize) {
    if count > 0 {
        counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
    }
}

pub fn record_denied(kind: OperationKind) {
    counter!(names::ADMISSIONS_DENIED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_flush_batch(success: bool) {
    if success {
        counter!(names::FLUSH_BATCHES_TOTAL).increment(1);
    } else {
        counter!(names::FLUSH_FAILURES_TOTAL).increment(1);
    }
}

pub fn set_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

pub fn set_active_subscriptions(count: usize) {
    gauge!(names::ACTIVE_SUBSCRIPTIONS).set(count as f64);
}

/// Publish a usage snapshot as gauges.
pub fn publish_usage(stats: &UsageStats) {
    gauge!(names::DAILY_USAGE, "kind" => "read").set(stats.reads as f64);
    gauge!(names::DAILY_USAGE, "kind" => "write").set(stats.writes as f64);
    gauge!(names::DAILY_USAGE, "kind" => "delete").set(stats.deletes as f64);
    gauge!(names::BACKOFF_LEVEL).set(stats.backoff_level as f64);
}
