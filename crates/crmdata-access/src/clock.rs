//! Wall-clock source for day boundaries, TTLs and idle tracking.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date in the user's local time zone.
    fn local_date(&self) -> NaiveDate;
}

/// The system clock, with dates in the host's local zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_date(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// A clock that follows tokio's (pausable) time plus manual jumps.
///
/// `now = base + tokio elapsed + skipped`. Under `start_paused` tests,
/// `tokio::time::advance` moves timers and this clock together, while
/// [`ManualClock::advance`] jumps the wall clock alone. Local dates are UTC.
#[derive(Debug)]
pub struct ManualClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
    skipped: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
            skipped: Mutex::new(Duration::ZERO),
        }
    }

    /// Jump the wall clock forward without firing timers.
    pub fn advance(&self, by: Duration) {
        let mut skipped = self.skipped.lock().unwrap_or_else(|e| e.into_inner());
        *skipped += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let skipped = *self.skipped.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = self.started.elapsed() + skipped;
        self.base + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    fn local_date(&self) -> NaiveDate {
        self.now().date_naive()
    }
}
