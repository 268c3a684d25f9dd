//! Metered operation kinds and queued write intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::DocKey;
use crate::payload::Payload;

/// Kind of operation counted against the provider's daily quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Delete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [Self::Read, Self::Write, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for a set write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Merge into the existing document instead of replacing it.
    pub merge: bool,
}

impl WriteOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }
}

/// What a pending write does to its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteKind {
    Set { merge: bool },
    Update,
    Delete,
}

/// A write intent waiting in the batch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub kind: WriteKind,
    pub key: DocKey,
    /// Fields to write; `None` for deletes.
    pub payload: Option<Payload>,
    /// Field the server stamps with its commit time.
    pub server_timestamp_field: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn set(key: DocKey, payload: Payload, options: WriteOptions) -> Self {
        Self::new(WriteKind::Set { merge: options.merge }, key, Some(payload))
    }

    pub fn update(key: DocKey, payload: Payload) -> Self {
        Self::new(WriteKind::Update, key, Some(payload))
    }

    pub fn delete(key: DocKey) -> Self {
        Self::new(WriteKind::Delete, key, None)
    }

    fn new(kind: WriteKind, key: DocKey, payload: Option<Payload>) -> Self {
        Self {
            kind,
            key,
            payload,
            server_timestamp_field: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Ask the server to stamp `field` with the commit time.
    pub fn with_server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.server_timestamp_field = Some(field.into());
        self
    }

    pub fn enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self
    }

    /// Quota bucket this write is charged to.
    pub fn meter_kind(&self) -> OperationKind {
        match self.kind {
            WriteKind::Delete => OperationKind::Delete,
            WriteKind::Set { .. } | WriteKind::Update => OperationKind::Write,
        }
    }

    /// Field paths touched by a partial write, used as the update mask.
    pub fn field_paths(&self) -> Vec<String> {
        self.payload
            .as_ref()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meter_kind() {
        let key = DocKey::new("leads", "a");
        assert_eq!(PendingOperation::delete(key.clone()).meter_kind(), OperationKind::Delete);
        assert_eq!(
            PendingOperation::update(key, Payload::new()).meter_kind(),
            OperationKind::Write
        );
    }

    #[test]
    fn test_field_paths() {
        let payload = json!({"status": "won", "value": 10});
        let op = PendingOperation::update(
            DocKey::new("leads", "a"),
            payload.as_object().cloned().unwrap(),
        )
        .with_server_timestamp("updatedAt");
        assert_eq!(op.field_paths(), vec!["status".to_string(), "value".to_string()]);
        assert_eq!(op.server_timestamp_field.as_deref(), Some("updatedAt"));
    }
}
