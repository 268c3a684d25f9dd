//! Document and cache key scheme.
//!
//! Every document is addressed by a `(collection, doc_id)` pair. Cache entries
//! are keyed either by such a document key or by a normalized query signature,
//! so the two namespaces can never collide.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::query::{Query, QuerySpec};

/// Address of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocKey {
    collection: String,
    doc_id: String,
}

impl DocKey {
    /// Create a key for `doc_id` inside `collection`.
    ///
    /// `collection` may be a nested path such as `users/u1/leads`.
    pub fn new(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Relative document path, `collection/doc_id`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.doc_id)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.doc_id)
    }
}

/// Key under which the local cache stores a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A single document snapshot.
    Document(DocKey),
    /// A query result, keyed by its normalized signature.
    Query(String),
}

impl CacheKey {
    pub fn document(key: &DocKey) -> Self {
        Self::Document(key.clone())
    }

    pub fn query(spec: &QuerySpec) -> Self {
        Self::Query(spec.signature())
    }

    /// String form used by the persistence layer.
    ///
    /// Format: `doc:{collection}/{doc_id}` or `query:{signature}`
    pub fn storage_key(&self) -> String {
        match self {
            Self::Document(key) => format!("doc:{}", key.path()),
            Self::Query(signature) => format!("query:{}", signature),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

impl From<&DocKey> for CacheKey {
    fn from(key: &DocKey) -> Self {
        Self::document(key)
    }
}

/// Typed handle on a collection.
///
/// The type parameter ties documents read from or written to this collection
/// to a single payload shape, so keys and payloads cannot be mixed up at call
/// sites.
pub struct Collection<T> {
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Collection<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the document `doc_id` in this collection.
    pub fn doc(&self, doc_id: impl Into<String>) -> DocKey {
        DocKey::new(self.name.clone(), doc_id)
    }

    /// Start a query over this collection.
    pub fn query(&self) -> Query<T> {
        Query::new(QuerySpec::new(self.name.clone()))
    }
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_key_path() {
        let key = DocKey::new("users/u1/leads", "abc");
        assert_eq!(key.path(), "users/u1/leads/abc");
        assert_eq!(key.to_string(), "users/u1/leads/abc");
    }

    #[test]
    fn test_cache_key_namespaces_differ() {
        let doc = CacheKey::document(&DocKey::new("leads", "x"));
        let query = CacheKey::query(&QuerySpec::new("leads"));
        assert!(doc.storage_key().starts_with("doc:"));
        assert!(query.storage_key().starts_with("query:"));
        assert_ne!(doc, query);
    }

    #[test]
    fn test_collection_doc_key() {
        struct Lead;
        let leads: Collection<Lead> = Collection::new("leads");
        assert_eq!(leads.doc("42"), DocKey::new("leads", "42"));
        assert_eq!(leads.clone().name(), "leads");
    }
}
