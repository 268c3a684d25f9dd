//! File-backed key-value store.
//!
//! One gzip-compressed JSON record per key under a root directory. Writes go
//! to a temporary file first and are renamed into place, so a crash never
//! leaves a half-written record behind.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{compress, decompress, record_file_name, RECORD_EXTENSION};
use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;

/// On-disk record. The key is stored alongside the value because file names
/// are one-way digests.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: String,
}

/// Persistent store rooted at a directory.
#[derive(Debug)]
pub struct FileKvStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKvStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            StorageError::open_failed(format!("{}: {}", root.display(), e))
        })?;

        debug!(root = %root.display(), "Opened file key-value store");

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(record_file_name(key))
    }

    fn read_record(path: &Path) -> StorageResult<Option<StoredRecord>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let text = decompress(&bytes)
            .ok_or_else(|| StorageError::corrupt(path.display().to_string()))?;
        let record: StoredRecord = serde_json::from_str(&text)
            .map_err(|_| StorageError::corrupt(path.display().to_string()))?;

        Ok(Some(record))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match Self::read_record(&self.path_for(key))? {
            Some(record) if record.key == key => Ok(Some(record.value)),
            Some(_) => Err(StorageError::corrupt(key)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let record = StoredRecord {
            key: key.to_string(),
            value: value.to_string(),
        };
        let bytes = compress(&serde_json::to_string(&record)?)?;

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let suffix = format!(".{}", RECORD_EXTENSION);
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(&suffix))
                .unwrap_or(false);
            if !is_record {
                continue;
            }

            match Self::read_record(&path) {
                Ok(Some(record)) if record.key.starts_with(prefix) => keys.push(record.key),
                Ok(_) => {}
                Err(e) if e.is_corrupt() => {
                    warn!(path = %path.display(), "Removing corrupt record");
                    let _ = fs::remove_file(&path);
                }
                Err(e) => return Err(e),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.set("usage_meter", r#"{"reads":3}"#).unwrap();
        }

        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("usage_meter").unwrap().as_deref(),
            Some(r#"{"reads":3}"#)
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("k", "v").unwrap();
        tokio_test::assert_ok!(store.remove("k"));
        tokio_test::assert_ok!(store.remove("k"));
        assert_eq!(tokio_test::assert_ok!(store.get("k")), None);
    }

    #[test]
    fn test_keys_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("cache:doc:leads/2", "b").unwrap();
        store.set("cache:doc:leads/1", "a").unwrap();
        store.set("usage_meter", "{}").unwrap();

        assert_eq!(
            store.keys("cache:").unwrap(),
            vec!["cache:doc:leads/1".to_string(), "cache:doc:leads/2".to_string()]
        );
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("k", "v").unwrap();
        fs::write(dir.path().join(record_file_name("k")), b"garbage").unwrap();

        let err = store.get("k").unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_keys_drops_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("cache:a", "1").unwrap();
        fs::write(dir.path().join(record_file_name("cache:b")), b"garbage").unwrap();

        assert_eq!(store.keys("cache:").unwrap(), vec!["cache:a".to_string()]);
        assert!(!dir.path().join(record_file_name("cache:b")).exists());
    }
}
