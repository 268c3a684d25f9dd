//! Local snapshot cache with TTL expiry.
//!
//! Document snapshots and query results are stored in the key-value store as
//! `{payload, storedAt}` records. Expired or unreadable entries are evicted
//! when read and by [`LocalCache::sweep`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crmdata_models::{CacheKey, DocKey, Payload, QuerySpec};
use crmdata_storage::KvStore;

use crate::clock::Clock;
use crate::error::AccessResult;
use crate::metrics::{record_cache_evictions, record_cache_lookup};

/// Prefix of every cache record in the key-value store.
pub const CACHE_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    payload: Json,
    stored_at: DateTime<Utc>,
}

pub struct LocalCache {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { kv, clock, ttl }
    }

    fn storage_key(key: &CacheKey) -> String {
        format!("{}{}", CACHE_PREFIX, key.storage_key())
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        let age = (self.clock.now() - entry.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age > self.ttl
    }

    fn read_entry(&self, storage_key: &str) -> AccessResult<Option<CacheEntry>> {
        match self.kv.get(storage_key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn evict(&self, storage_key: &str) {
        if let Err(e) = self.kv.remove(storage_key) {
            warn!(key = %storage_key, error = %e, "Failed to evict cache entry");
        }
        record_cache_evictions(1);
    }

    /// Store `payload` under `key`, stamped now.
    pub fn put(&self, key: &CacheKey, payload: Json) {
        let entry = CacheEntry {
            payload,
            stored_at: self.clock.now(),
        };
        if let Err(e) = self.write_entry(&Self::storage_key(key), &entry) {
            warn!(key = %key, error = %e, "Failed to write cache entry");
        }
    }

    fn write_entry(&self, storage_key: &str, entry: &CacheEntry) -> AccessResult<()> {
        let raw = serde_json::to_string(entry)?;
        self.kv.set(storage_key, &raw)?;
        Ok(())
    }

    /// Fresh payload under `key`, evicting it if expired or unreadable.
    pub fn get(&self, key: &CacheKey) -> Option<Json> {
        let storage_key = Self::storage_key(key);
        let hit = match self.read_entry(&storage_key) {
            Ok(Some(entry)) if self.is_expired(&entry) => {
                debug!(key = %key, "Cache entry expired");
                self.evict(&storage_key);
                None
            }
            Ok(Some(entry)) => Some(entry.payload),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Evicting unreadable cache entry");
                self.evict(&storage_key);
                None
            }
        };
        record_cache_lookup(hit.is_some());
        hit
    }

    pub fn remove(&self, key: &CacheKey) {
        if let Err(e) = self.kv.remove(&Self::storage_key(key)) {
            warn!(key = %key, error = %e, "Failed to remove cache entry");
        }
    }

    /// Evict every expired or unreadable entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let keys = match self.kv.keys(CACHE_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Cache sweep could not list entries");
                return 0;
            }
        };

        let mut evicted = 0;
        for storage_key in keys {
            let stale = match self.read_entry(&storage_key) {
                Ok(Some(entry)) => self.is_expired(&entry),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale {
                if let Err(e) = self.kv.remove(&storage_key) {
                    warn!(key = %storage_key, error = %e, "Failed to evict cache entry");
                    continue;
                }
                evicted += 1;
            }
        }

        record_cache_evictions(evicted);
        if evicted > 0 {
            debug!(evicted, "Cache sweep complete");
        }
        evicted
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    pub fn put_document(&self, key: &DocKey, payload: &Payload) {
        self.put(&CacheKey::document(key), Json::Object(payload.clone()));
    }

    pub fn get_document(&self, key: &DocKey) -> Option<Payload> {
        match self.get(&CacheKey::document(key))? {
            Json::Object(payload) => Some(payload),
            _ => {
                self.remove(&CacheKey::document(key));
                None
            }
        }
    }

    pub fn remove_document(&self, key: &DocKey) {
        self.remove(&CacheKey::document(key));
    }

    pub fn put_query(&self, spec: &QuerySpec, results: &[Payload]) {
        let rows = results.iter().cloned().map(Json::Object).collect();
        self.put(&CacheKey::query(spec), Json::Array(rows));
    }

    pub fn get_query(&self, spec: &QuerySpec) -> Option<Vec<Payload>> {
        let key = CacheKey::query(spec);
        let Json::Array(rows) = self.get(&key)? else {
            self.remove(&key);
            return None;
        };
        rows.into_iter()
            .map(|row| match row {
                Json::Object(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }
}
