//! Query description and cache signature normalization.
//!
//! A query is a collection plus conjunctive field filters, an ordered list of
//! sort fields and an optional limit. [`QuerySpec::signature`] renders it into
//! a deterministic string used as the query cache key.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while building queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("Unknown filter operator: {0}")]
    UnknownOperator(String),
}

// ============================================================================
// Filters
// ============================================================================

/// Comparison operator of a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    NotIn,
    ArrayContainsAny,
}

impl FilterOp {
    /// Operator as written at call sites (`==`, `array-contains`, ...).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::ArrayContains => "array-contains",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::ArrayContainsAny => "array-contains-any",
        }
    }

    /// Firestore `FieldFilter.op` name.
    pub const fn firestore_op(&self) -> &'static str {
        match self {
            Self::Equal => "EQUAL",
            Self::NotEqual => "NOT_EQUAL",
            Self::LessThan => "LESS_THAN",
            Self::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Self::GreaterThan => "GREATER_THAN",
            Self::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Self::ArrayContains => "ARRAY_CONTAINS",
            Self::In => "IN",
            Self::NotIn => "NOT_IN",
            Self::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        }
    }
}

impl FromStr for FilterOp {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            "<" => Ok(Self::LessThan),
            "<=" => Ok(Self::LessThanOrEqual),
            ">" => Ok(Self::GreaterThan),
            ">=" => Ok(Self::GreaterThanOrEqual),
            "array-contains" => Ok(Self::ArrayContains),
            "in" => Ok(Self::In),
            "not-in" => Ok(Self::NotIn),
            "array-contains-any" => Ok(Self::ArrayContainsAny),
            other => Err(QueryError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(field, operator, value)` filter triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Canonical text of this filter: a JSON triple, unambiguous for any
    /// field name or value.
    fn canonical(&self) -> String {
        // serde_json maps are ordered, so nested object values render stably.
        Value::Array(vec![
            Value::String(self.field.clone()),
            Value::String(self.op.as_str().to_string()),
            self.value.clone(),
        ])
        .to_string()
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Sort direction for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }

    /// Get the Firestore direction string.
    pub const fn firestore_direction(&self) -> &'static str {
        match self {
            Self::Ascending => "ASCENDING",
            Self::Descending => "DESCENDING",
        }
    }
}

/// One sort field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

// ============================================================================
// Query
// ============================================================================

/// Untyped query description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    collection: String,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
}

impl QuerySpec {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Add a filter.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    /// Add an ascending sort field.
    pub fn order_by(self, field: impl Into<String>) -> Self {
        self.order_by_direction(field, SortDirection::Ascending)
    }

    /// Add a descending sort field.
    pub fn order_by_desc(self, field: impl Into<String>) -> Self {
        self.order_by_direction(field, SortDirection::Descending)
    }

    pub fn order_by_direction(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn sort_fields(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn result_limit(&self) -> Option<u32> {
        self.limit
    }

    /// Normalized cache signature.
    ///
    /// Filters are conjunctive, so they are sorted by their canonical text and
    /// two queries differing only in filter order share one signature. Sort
    /// fields keep caller order because their order changes the result.
    ///
    /// Format: `{collection}?where=[...]&orderBy=[field:dir,...]&limit={n|none}`
    pub fn signature(&self) -> String {
        let mut filters: Vec<String> = self.filters.iter().map(Filter::canonical).collect();
        filters.sort();

        let order: Vec<String> = self
            .order_by
            .iter()
            .map(|o| format!("{}:{}", o.field, o.direction.as_str()))
            .collect();

        let limit = self
            .limit
            .map(|l| l.to_string())
            .unwrap_or_else(|| "none".to_string());

        format!(
            "{}?where=[{}]&orderBy=[{}]&limit={}",
            self.collection,
            filters.join(","),
            order.join(","),
            limit
        )
    }
}

/// Query bound to the payload type of its collection.
pub struct Query<T> {
    spec: QuerySpec,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Query<T> {
    pub fn new(spec: QuerySpec) -> Self {
        Self {
            spec,
            _payload: PhantomData,
        }
    }

    pub fn filter(self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::new(self.spec.filter(field, op, value))
    }

    pub fn order_by(self, field: impl Into<String>) -> Self {
        Self::new(self.spec.order_by(field))
    }

    pub fn order_by_desc(self, field: impl Into<String>) -> Self {
        Self::new(self.spec.order_by_desc(field))
    }

    pub fn limit(self, limit: u32) -> Self {
        Self::new(self.spec.limit(limit))
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self::new(self.spec.clone())
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Query").field(&self.spec).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
