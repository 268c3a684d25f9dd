//! Periodic housekeeping for a [`DataAccess`] instance.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, Instrument};

use crate::coalescer::FlushOutcome;
use crate::facade::{AccessInner, DataAccess};

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    /// The daily usage window was reset
    pub rolled_over: bool,
    /// Idle subscriptions torn down
    pub subscriptions_closed: usize,
    /// Expired or unreadable cache entries removed
    pub cache_evicted: usize,
    /// Retry flush of queued writes, if one ran
    pub flush: Option<FlushOutcome>,
}

/// Spawn the maintenance loop. The first pass runs one `period` from now.
///
/// The task holds only a weak reference and exits once the owning
/// [`DataAccess`] is gone.
pub(crate) fn spawn(inner: Weak<AccessInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            info!("Starting maintenance (interval: {:?})", period);

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let report = DataAccess::from_inner(inner).run_maintenance().await;
                debug!(?report, "Maintenance pass complete");
            }
        }
        .instrument(tracing::info_span!("maintenance")),
    )
}
