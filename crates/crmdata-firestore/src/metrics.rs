//! Firestore transport metrics.

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Total Firestore requests by operation and status.
    pub const REQUESTS_TOTAL: &str = "crm_firestore_requests_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "crm_firestore_retries_total";

    /// Request latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "crm_firestore_latency_seconds";

    /// Writes sent in commits.
    pub const COMMIT_WRITES_TOTAL: &str = "crm_firestore_commit_writes_total";

    /// Listener polls, labelled by whether the document changed.
    pub const LISTEN_POLLS_TOTAL: &str = "crm_firestore_listen_polls_total";
}

/// Record metrics for a completed Firestore request.
pub fn record_request(operation: &str, status: u16, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_commit(writes: usize) {
    counter!(names::COMMIT_WRITES_TOTAL).increment(writes as u64);
}

pub fn record_listen_poll(changed: bool) {
    counter!(
        names::LISTEN_POLLS_TOTAL,
        "changed" => if changed { "true" } else { "false" }
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::REQUESTS_TOTAL.contains("requests"));
        assert!(names::RETRIES_TOTAL.contains("retries"));
        assert!(names::LATENCY_SECONDS.contains("latency"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request("get_document", 200, 12.0);
        record_commit(3);
        record_listen_poll(true);
    }
}
