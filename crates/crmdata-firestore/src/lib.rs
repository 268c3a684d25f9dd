//! Document-store transport for the CRM data layer.
//!
//! This crate provides:
//! - The [`DocumentStore`] seam: point reads, structured queries, atomic
//!   commits and document change subscriptions
//! - A Firestore REST client implementing it, with service-account auth,
//!   token caching, retry with backoff and polling listeners
//! - An in-memory implementation for local runs and tests

pub mod client;
pub mod convert;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod query_builder;
pub mod retry;
pub mod store;
pub mod token_cache;
pub mod transport;
pub mod types;


pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use memory::MemoryDocumentStore;
pub use retry::RetryConfig;
pub use transport::{
    DocumentStore, ListenEvent, RemoteDocument, RemoteListener, RemoteSnapshot, DOCUMENT_ID_FIELD,
    MAX_COMMIT_WRITES,
};
