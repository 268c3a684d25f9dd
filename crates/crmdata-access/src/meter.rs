//! Daily usage meter and failure backoff.
//!
//! Counts reads, writes and deletes against the provider's daily quota and
//! decides whether new operations may start. Quota overage is advisory: the
//! meter warns at 70% and 90% of a limit but keeps admitting. The only hard
//! denial is a sustained outage, five or more consecutive transport failures
//! with the backoff window still open.
//!
//! State is persisted to the key-value store after every change so counts
//! survive restarts within the same day.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crmdata_models::{OperationKind, UsageStats};
use crmdata_storage::KvStore;

use crate::clock::Clock;
use crate::config::QuotaLimits;
use crate::error::AccessResult;
use crate::metrics::{publish_usage, record_denied};

/// Storage key of the persisted meter state.
pub const METER_STORAGE_KEY: &str = "usage_meter";

/// Consecutive failures at which admissions are refused during backoff.
pub const HARD_DENY_FAILURES: u32 = 5;

/// Upper bound of the backoff window.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15);

const WARNING_RATIO: f64 = 0.7;
const CRITICAL_RATIO: f64 = 0.9;

/// Backoff window after `failures` consecutive failures: `min(15s, 1.5^n s)`.
pub fn backoff_window(failures: u32) -> Duration {
    let secs = 1.5f64.powi(failures.min(64) as i32);
    Duration::from_secs_f64(secs).min(MAX_BACKOFF)
}

/// Threshold alert already raised for a counter in the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Alert {
    #[default]
    None,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationCounter {
    count: u64,
    alert: Alert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterState {
    reads: OperationCounter,
    writes: OperationCounter,
    deletes: OperationCounter,
    last_reset: DateTime<Utc>,
    reset_date: NaiveDate,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl MeterState {
    fn fresh(now: DateTime<Utc>, today: NaiveDate) -> Self {
        Self {
            reads: OperationCounter::default(),
            writes: OperationCounter::default(),
            deletes: OperationCounter::default(),
            last_reset: now,
            reset_date: today,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }

    fn counter_mut(&mut self, kind: OperationKind) -> &mut OperationCounter {
        match kind {
            OperationKind::Read => &mut self.reads,
            OperationKind::Write => &mut self.writes,
            OperationKind::Delete => &mut self.deletes,
        }
    }

    fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        match self.last_failure_at {
            Some(at) if self.consecutive_failures > 0 => {
                let elapsed = (now - at).to_std().unwrap_or(Duration::ZERO);
                elapsed < backoff_window(self.consecutive_failures)
            }
            _ => false,
        }
    }
}

/// Daily quota meter.
pub struct UsageMeter {
    limits: QuotaLimits,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<MeterState>,
}

impl UsageMeter {
    /// Load persisted state, starting fresh if it is missing or unreadable.
    pub fn new(limits: QuotaLimits, kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        let state = match Self::load(kv.as_ref()) {
            Ok(Some(state)) => state,
            Ok(None) => MeterState::fresh(clock.now(), clock.local_date()),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable usage meter state");
                if let Err(e) = kv.remove(METER_STORAGE_KEY) {
                    warn!(error = %e, "Failed to remove usage meter state");
                }
                MeterState::fresh(clock.now(), clock.local_date())
            }
        };

        let meter = Self {
            limits,
            kv,
            clock,
            state: Mutex::new(state),
        };
        meter.roll_over_if_due();
        meter
    }

    fn load(kv: &dyn KvStore) -> AccessResult<Option<MeterState>> {
        match kv.get(METER_STORAGE_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &MeterState) {
        if let Err(e) = self.try_persist(state) {
            error!(error = %e, "Failed to persist usage meter state");
        }
    }

    fn try_persist(&self, state: &MeterState) -> AccessResult<()> {
        let raw = serde_json::to_string(state)?;
        self.kv.set(METER_STORAGE_KEY, &raw)?;
        Ok(())
    }

    fn limit(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::Read => self.limits.reads,
            OperationKind::Write => self.limits.writes,
            OperationKind::Delete => self.limits.deletes,
        }
    }

    /// Reset the window if the local date changed or 24h have passed.
    fn roll_over_locked(&self, state: &mut MeterState) -> bool {
        let now = self.clock.now();
        let today = self.clock.local_date();
        let day_elapsed = now - state.last_reset >= chrono::Duration::hours(24);
        if today == state.reset_date && !day_elapsed {
            return false;
        }

        info!(
            reads = state.reads.count,
            writes = state.writes.count,
            deletes = state.deletes.count,
            "Resetting daily usage counters"
        );
        *state = MeterState::fresh(now, today);
        true
    }

    /// Run the daily reset check. Returns true if the counters were reset.
    pub fn roll_over_if_due(&self) -> bool {
        let mut state = self.lock();
        let rolled = self.roll_over_locked(&mut state);
        if rolled {
            self.persist(&state);
        }
        rolled
    }

    /// Decide whether `count` operations of `kind` may start, counting them
    /// if so.
    pub fn admit(&self, kind: OperationKind, count: u64) -> bool {
        let mut state = self.lock();
        self.roll_over_locked(&mut state);

        if state.consecutive_failures >= HARD_DENY_FAILURES && state.in_backoff(self.clock.now()) {
            debug!(
                kind = %kind,
                failures = state.consecutive_failures,
                "Operation denied during backoff"
            );
            record_denied(kind);
            return false;
        }

        self.count_locked(&mut state, kind, count);
        self.persist(&state);
        true
    }

    /// Count operations that already happened (extra query results,
    /// listener notifications) without an admission decision.
    pub fn record_usage(&self, kind: OperationKind, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.lock();
        self.roll_over_locked(&mut state);
        self.count_locked(&mut state, kind, count);
        self.persist(&state);
    }

    fn count_locked(&self, state: &mut MeterState, kind: OperationKind, count: u64) {
        let limit = self.limit(kind).max(1);
        let counter = state.counter_mut(kind);
        counter.count = counter.count.saturating_add(count);

        let ratio = counter.count as f64 / limit as f64;
        let alert = if ratio >= CRITICAL_RATIO {
            Alert::Critical
        } else if ratio >= WARNING_RATIO {
            Alert::Warning
        } else {
            Alert::None
        };

        if alert > counter.alert {
            counter.alert = alert;
            let pct = (ratio * 100.0).round() as u64;
            match alert {
                Alert::Critical => error!(
                    kind = %kind,
                    count = counter.count,
                    limit,
                    "Daily quota {}% used",
                    pct
                ),
                _ => warn!(
                    kind = %kind,
                    count = counter.count,
                    limit,
                    "Daily quota {}% used",
                    pct
                ),
            }
        }
    }

    /// Note a failed remote operation, widening the backoff window.
    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(self.clock.now());
        warn!(
            failures = state.consecutive_failures,
            window_ms = backoff_window(state.consecutive_failures).as_millis() as u64,
            "Remote operation failed, backing off"
        );
        self.persist(&state);
    }

    /// Note a successful remote operation, closing the backoff window.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.consecutive_failures == 0 {
            return;
        }
        info!(failures = state.consecutive_failures, "Remote store recovered");
        state.consecutive_failures = 0;
        self.persist(&state);
    }

    pub fn is_in_backoff(&self) -> bool {
        self.lock().in_backoff(self.clock.now())
    }

    pub fn stats(&self) -> UsageStats {
        let state = self.lock();
        let stats = UsageStats {
            reads: state.reads.count,
            writes: state.writes.count,
            deletes: state.deletes.count,
            last_reset: state.last_reset,
            in_backoff: state.in_backoff(self.clock.now()),
            backoff_level: state.consecutive_failures,
        };
        publish_usage(&stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use crmdata_storage::MemoryKvStore;

    fn meter_with(kv: Arc<MemoryKvStore>, clock: Arc<ManualClock>) -> UsageMeter {
        UsageMeter::new(QuotaLimits::default(), kv, clock)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()))
    }

    #[test]
    fn test_backoff_window() {
        assert_eq!(backoff_window(0), Duration::from_secs(1));
        assert_eq!(backoff_window(2), Duration::from_secs_f64(2.25));
        assert_eq!(backoff_window(7), MAX_BACKOFF);
        assert_eq!(backoff_window(u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_accumulate_per_kind() {
        let meter = meter_with(Arc::new(MemoryKvStore::new()), clock());
        assert!(meter.admit(OperationKind::Read, 1));
        assert!(meter.admit(OperationKind::Read, 4));
        assert!(meter.admit(OperationKind::Delete, 1));
        meter.record_usage(OperationKind::Write, 2);

        let stats = meter.stats();
        assert_eq!((stats.reads, stats.writes, stats.deletes), (5, 2, 1));
        assert!(!stats.in_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_overage_is_advisory() {
        let limits = QuotaLimits {
            reads: 2,
            writes: 2,
            deletes: 2,
        };
        let meter = UsageMeter::new(limits, Arc::new(MemoryKvStore::new()), clock());
        for _ in 0..5 {
            assert!(meter.admit(OperationKind::Write, 1));
        }
        assert_eq!(meter.stats().writes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deny_after_five_failures() {
        let clock = clock();
        let meter = meter_with(Arc::new(MemoryKvStore::new()), Arc::clone(&clock));
        for _ in 0..4 {
            meter.record_failure();
        }
        assert!(meter.is_in_backoff());
        assert!(meter.admit(OperationKind::Read, 1));

        meter.record_failure();
        for kind in OperationKind::ALL {
            assert!(!meter.admit(kind, 1));
        }
        assert_eq!(meter.stats().reads, 1);

        // 1.5^5 ≈ 7.6s later the window closes and a probe is admitted.
        clock.advance(Duration::from_secs(8));
        assert!(meter.admit(OperationKind::Read, 1));
        meter.record_success();
        assert!(!meter.is_in_backoff());
        assert_eq!(meter.stats().backoff_level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resets_on_new_day() {
        let clock = clock();
        let meter = meter_with(Arc::new(MemoryKvStore::new()), Arc::clone(&clock));
        meter.admit(OperationKind::Write, 10);
        meter.record_failure();

        clock.advance(Duration::from_secs(16 * 3600));
        assert!(meter.roll_over_if_due());

        let stats = meter.stats();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.backoff_level, 0);
        assert!(!meter.roll_over_if_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_restart() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = clock();
        {
            let meter = meter_with(Arc::clone(&kv), Arc::clone(&clock));
            meter.admit(OperationKind::Read, 3);
        }
        let meter = meter_with(kv, clock);
        assert_eq!(meter.stats().reads, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_state_starts_fresh() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(METER_STORAGE_KEY, "{not json").unwrap();

        let meter = meter_with(Arc::clone(&kv), clock());
        assert_eq!(meter.stats().reads, 0);
        assert!(meter.admit(OperationKind::Read, 1));
        assert!(kv.get(METER_STORAGE_KEY).unwrap().unwrap().contains("\"reads\""));
    }
}
