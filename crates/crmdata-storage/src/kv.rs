//! The key-value persistence surface.

use crate::error::StorageResult;

/// Synchronous, string-keyed persistence.
///
/// Implementations must be safe to share between tasks; every call is short
/// and never blocks on the network.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
