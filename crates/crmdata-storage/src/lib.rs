//! Key-value persistence for the CRM data-access layer.
//!
//! This crate provides:
//! - The synchronous, string-keyed [`KvStore`] surface used for usage
//!   counters and cache entries
//! - An in-memory store for tests and ephemeral sessions
//! - A file-backed store (gzip-compressed JSON records) that survives
//!   process restarts

pub mod codec;
pub mod error;
pub mod file;
pub mod kv;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use file::FileKvStore;
pub use kv::KvStore;
pub use memory::MemoryKvStore;
