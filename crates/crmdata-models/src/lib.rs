//! Shared data models for the CRM data-access layer.
//!
//! This crate provides Serde-serializable types for:
//! - Document and cache keys (`DocKey`, `CacheKey`, typed `Collection<T>`)
//! - Queries and their normalized cache signatures
//! - Pending write operations queued for batch commit
//! - Usage statistics reported by the quota meter

pub mod key;
pub mod operation;
pub mod payload;
pub mod query;
pub mod usage;

// Re-export common types
pub use key::{CacheKey, Collection, DocKey};
pub use operation::{OperationKind, PendingOperation, WriteKind, WriteOptions};
pub use payload::{merge_payload, Payload};
pub use query::{Filter, FilterOp, OrderBy, Query, QueryError, QuerySpec, SortDirection};
pub use usage::UsageStats;
