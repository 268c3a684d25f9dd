//! Data-access configuration.

use std::time::Duration;

/// Daily operation limits imposed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            reads: 50_000,
            writes: 20_000,
            deletes: 20_000,
        }
    }
}

/// Data-access configuration.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Daily quota per operation kind
    pub quota: QuotaLimits,
    /// Maximum writes per atomic commit
    pub batch_max_size: usize,
    /// Debounce delay between the last enqueue and the automatic flush
    pub flush_delay: Duration,
    /// How long a cached snapshot stays valid
    pub cache_ttl: Duration,
    /// Subscriptions untouched for this long are torn down
    pub subscription_idle: Duration,
    /// Period of the maintenance task
    pub maintenance_interval: Duration,
    /// Field stamped with the server commit time on every write
    pub server_timestamp_field: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            quota: QuotaLimits::default(),
            batch_max_size: 500,
            flush_delay: Duration::from_millis(1000),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            subscription_idle: Duration::from_secs(15 * 60),
            maintenance_interval: Duration::from_secs(5 * 60),
            server_timestamp_field: "updatedAt".to_string(),
        }
    }
}

impl AccessConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            quota: QuotaLimits {
                reads: env_parse("CRM_QUOTA_DAILY_READS", defaults.quota.reads),
                writes: env_parse("CRM_QUOTA_DAILY_WRITES", defaults.quota.writes),
                deletes: env_parse("CRM_QUOTA_DAILY_DELETES", defaults.quota.deletes),
            },
            batch_max_size: env_parse("CRM_BATCH_MAX_SIZE", defaults.batch_max_size)
                .clamp(1, crmdata_firestore::MAX_COMMIT_WRITES),
            flush_delay: Duration::from_millis(env_parse("CRM_BATCH_FLUSH_DELAY_MS", 1000)),
            cache_ttl: Duration::from_secs(env_parse("CRM_CACHE_TTL_SECS", 86_400)),
            subscription_idle: Duration::from_secs(env_parse("CRM_SUBSCRIPTION_IDLE_SECS", 900)),
            maintenance_interval: Duration::from_secs(
                env_parse("CRM_MAINTENANCE_INTERVAL_SECS", 300u64).max(1),
            ),
            server_timestamp_field: std::env::var("CRM_SERVER_TIMESTAMP_FIELD")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.server_timestamp_field),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
