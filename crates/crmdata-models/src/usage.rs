//! Usage statistics exposed to observability surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read-only snapshot of the quota meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Reads counted in the current daily window
    pub reads: u64,
    /// Writes counted in the current daily window
    pub writes: u64,
    /// Deletes counted in the current daily window
    pub deletes: u64,
    /// When the counters were last reset
    pub last_reset: DateTime<Utc>,
    /// Whether the failure backoff window is currently open
    pub in_backoff: bool,
    /// Consecutive failure count driving the backoff window
    pub backoff_level: u32,
}
