//! Monitor configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crmdata_models::DocKey;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Directory holding the usage counters and cached snapshots
    pub data_dir: PathBuf,
    /// How often usage is logged
    pub stats_interval: Duration,
    /// Prometheus scrape endpoint, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Documents kept under a live subscription
    pub watch: Vec<DocKey>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/tmp/crmdata"),
            stats_interval: Duration::from_secs(60),
            metrics_addr: None,
            watch: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CRM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            stats_interval: Duration::from_secs(
                std::env::var("CRM_STATS_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(60),
            ),
            metrics_addr: std::env::var("CRM_METRICS_ADDR")
                .ok()
                .and_then(|s| s.parse().ok()),
            watch: std::env::var("CRM_WATCH_DOCUMENTS")
                .map(|s| parse_watch_list(&s))
                .unwrap_or_default(),
        }
    }
}

/// Parse a comma-separated list of `collection/id` paths. Malformed entries
/// are skipped.
pub fn parse_watch_list(raw: &str) -> Vec<DocKey> {
    raw.split(',')
        .map(str::trim)
        .filter_map(|path| {
            let (collection, id) = path.split_once('/')?;
            if collection.is_empty() || id.is_empty() || id.contains('/') {
                tracing::warn!(path, "Ignoring malformed watch path");
                return None;
            }
            Some(DocKey::new(collection, id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_watch_list() {
        let keys = parse_watch_list(" leads/l1, deals/d-9 ,bad, /x, a/b/c,");
        assert_eq!(keys, vec![DocKey::new("leads", "l1"), DocKey::new("deals", "d-9")]);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("CRM_DATA_DIR", "/var/lib/crm");
        std::env::set_var("CRM_STATS_INTERVAL_SECS", "0");
        std::env::set_var("CRM_METRICS_ADDR", "127.0.0.1:9184");
        std::env::set_var("CRM_WATCH_DOCUMENTS", "leads/l1");

        let config = MonitorConfig::from_env();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/crm"));
        assert_eq!(config.stats_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9184".parse().unwrap()));
        assert_eq!(config.watch, vec![DocKey::new("leads", "l1")]);

        for var in [
            "CRM_DATA_DIR",
            "CRM_STATS_INTERVAL_SECS",
            "CRM_METRICS_ADDR",
            "CRM_WATCH_DOCUMENTS",
        ] {
            std::env::remove_var(var);
        }
    }
}
