//! Error types for the data-access layer.
//!
//! These never cross the public façade: reads degrade to cached or empty
//! results and writes to no-ops. They exist so the internals can use `?`
//! and log one well-classified message at the boundary.

use thiserror::Error;

use crmdata_firestore::FirestoreError;
use crmdata_storage::StorageError;

pub type AccessResult<T> = Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] FirestoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl AccessError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Whether this failure should widen the meter's backoff window.
    ///
    /// Only transport outages count; a missing document or a rejected
    /// precondition is a definite answer from a healthy server.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            Self::Transport(e) => crmdata_firestore::retry::is_transport_failure(e),
            _ => false,
        }
    }
}
