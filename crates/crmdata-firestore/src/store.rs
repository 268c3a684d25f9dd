//! [`DocumentStore`] over the Firestore REST client.

use async_trait::async_trait;

use crmdata_models::{DocKey, PendingOperation, QuerySpec, WriteKind};

use crate::client::FirestoreClient;
use crate::convert::{document_to_remote, payload_to_fields};
use crate::error::{FirestoreError, FirestoreResult};
use crate::query_builder::build_structured_query;
use crate::transport::{DocumentStore, RemoteDocument, RemoteListener, MAX_COMMIT_WRITES};
use crate::types::{Document, DocumentMask, FieldTransform, Precondition, Write};

impl FirestoreClient {
    /// Translate one queued operation into a commit write.
    ///
    /// Merge sets and updates carry an update mask of the touched fields;
    /// updates also require the document to exist. A server timestamp field
    /// becomes a `REQUEST_TIME` transform instead of a stored value.
    pub fn write_for(&self, op: &PendingOperation) -> Write {
        let name = self.full_document_name(&op.key);

        if op.kind == WriteKind::Delete {
            return Write {
                delete: Some(name),
                ..Write::default()
            };
        }

        let mut payload = op.payload.clone().unwrap_or_default();
        if let Some(field) = &op.server_timestamp_field {
            payload.remove(field);
        }

        let update_mask = match op.kind {
            WriteKind::Set { merge: true } | WriteKind::Update => Some(DocumentMask {
                field_paths: payload.keys().map(|key| quote_field_name(key)).collect(),
            }),
            _ => None,
        };

        let current_document = match op.kind {
            WriteKind::Update => Some(Precondition {
                exists: Some(true),
                update_time: None,
            }),
            _ => None,
        };

        Write {
            update: Some(Document::named(name, payload_to_fields(&payload))),
            update_mask,
            update_transforms: op
                .server_timestamp_field
                .as_ref()
                .map(|field| vec![FieldTransform::request_time(quote_field_name(field))]),
            current_document,
            ..Write::default()
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn get(&self, key: &DocKey) -> FirestoreResult<Option<RemoteDocument>> {
        let doc = self
            .with_retry("get_document", || self.get_document(key))
            .await?;
        Ok(doc.map(document_to_remote))
    }

    async fn query(&self, spec: &QuerySpec) -> FirestoreResult<Vec<RemoteDocument>> {
        let (parent, query) = build_structured_query(spec);
        let docs = self
            .with_retry("run_query", || self.run_query(&parent, query.clone()))
            .await?;
        Ok(docs.into_iter().map(document_to_remote).collect())
    }

    async fn commit(&self, writes: &[PendingOperation]) -> FirestoreResult<()> {
        if writes.len() > MAX_COMMIT_WRITES {
            return Err(FirestoreError::request_failed(format!(
                "{} writes exceed the {} write commit limit",
                writes.len(),
                MAX_COMMIT_WRITES
            )));
        }

        let body: Vec<Write> = writes.iter().map(|op| self.write_for(op)).collect();
        self.with_retry("commit", || self.commit_writes(body.clone()))
            .await?;
        Ok(())
    }

    fn listen(&self, key: &DocKey) -> RemoteListener {
        self.poll_document(key)
    }
}

/// Field path for one top-level field name.
///
/// Names outside `[A-Za-z_][A-Za-z0-9_]*` are backtick-quoted, with backticks
/// and backslashes escaped.
fn quote_field_name(name: &str) -> String {
    let mut chars = name.chars();
    let simple = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        return name.to_string();
    }

    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('`');
    for c in name.chars() {
        if c == '`' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('`');
    quoted
}
