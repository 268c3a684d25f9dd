//! Quota-aware data access for the CRM document store.
//!
//! This crate provides:
//! - A daily usage meter with advisory quota thresholds and failure backoff
//! - A TTL cache of document and query snapshots over key-value storage
//! - A write coalescer committing debounced, size-capped atomic batches
//! - Deduplicated live document subscriptions
//! - The [`DataAccess`] façade tying them together, plus periodic maintenance

pub mod cache;
pub mod clock;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod facade;
pub mod maintenance;
pub mod meter;
pub mod metrics;
pub mod subscriptions;

pub use cache::LocalCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalescer::{BatchCoalescer, FlushOutcome};
pub use config::{AccessConfig, QuotaLimits};
pub use error::{AccessError, AccessResult};
pub use facade::{DataAccess, WriteStatus};
pub use maintenance::MaintenanceReport;
pub use meter::UsageMeter;
pub use subscriptions::{SubscriptionHandle, SubscriptionRegistry};
