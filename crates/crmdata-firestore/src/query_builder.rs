//! Translate a [`QuerySpec`] into a Firestore structured query.

use crmdata_models::QuerySpec;

use crate::convert::json_to_value;
use crate::types::{
    CollectionSelector, CompositeFilter, FieldFilter, FieldReference, Order, QueryFilter,
    StructuredQuery,
};

/// Split a collection path into its parent document path and collection id.
///
/// `leads` → (`""`, `leads`); `users/u1/leads` → (`users/u1`, `leads`)
pub fn split_collection_path(collection: &str) -> (&str, &str) {
    match collection.rsplit_once('/') {
        Some((parent, id)) => (parent, id),
        None => ("", collection),
    }
}

/// Build the `:runQuery` parent path and body for `spec`.
pub fn build_structured_query(spec: &QuerySpec) -> (String, StructuredQuery) {
    let (parent, collection_id) = split_collection_path(spec.collection());

    let mut field_filters: Vec<QueryFilter> = spec
        .filters()
        .iter()
        .map(|f| QueryFilter {
            composite_filter: None,
            field_filter: Some(FieldFilter {
                field: FieldReference {
                    field_path: f.field.clone(),
                },
                op: f.op.firestore_op().to_string(),
                value: json_to_value(&f.value),
            }),
        })
        .collect();

    let filter = match field_filters.len() {
        0 => None,
        1 => field_filters.pop(),
        _ => Some(QueryFilter {
            composite_filter: Some(CompositeFilter {
                op: "AND".to_string(),
                filters: field_filters,
            }),
            field_filter: None,
        }),
    };

    let order_by: Vec<Order> = spec
        .sort_fields()
        .iter()
        .map(|o| Order {
            field: FieldReference {
                field_path: o.field.clone(),
            },
            direction: o.direction.firestore_direction().to_string(),
        })
        .collect();

    let query = StructuredQuery {
        from: vec![CollectionSelector {
            collection_id: collection_id.to_string(),
            all_descendants: None,
        }],
        filter,
        order_by: if order_by.is_empty() { None } else { Some(order_by) },
        limit: spec.result_limit().map(|l| l.min(i32::MAX as u32) as i32),
    };

    (parent.to_string(), query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmdata_models::FilterOp;
    use serde_json::json;

    #[test]
    fn test_split_collection_path() {
        assert_eq!(split_collection_path("leads"), ("", "leads"));
        assert_eq!(split_collection_path("users/u1/leads"), ("users/u1", "leads"));
    }

    #[test]
    fn test_single_filter_is_not_wrapped() {
        let spec = QuerySpec::new("leads").filter("city", FilterOp::Equal, "Leeds");
        let (parent, query) = build_structured_query(&spec);
        assert_eq!(parent, "");
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["where"]["fieldFilter"]["op"], "EQUAL");
        assert_eq!(json["where"]["fieldFilter"]["value"], json!({"stringValue": "Leeds"}));
    }

    #[test]
    fn test_multiple_filters_use_and() {
        let spec = QuerySpec::new("users/u1/leads")
            .filter("city", FilterOp::Equal, "Leeds")
            .filter("budget", FilterOp::GreaterThan, 10000)
            .order_by_desc("timestamp")
            .limit(25);
        let (parent, query) = build_structured_query(&spec);
        assert_eq!(parent, "users/u1");

        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["from"][0]["collectionId"], "leads");
        assert_eq!(json["where"]["compositeFilter"]["op"], "AND");
        assert_eq!(json["where"]["compositeFilter"]["filters"].as_array().unwrap().len(), 2);
        assert_eq!(json["orderBy"][0]["direction"], "DESCENDING");
        assert_eq!(json["limit"], 25);
    }
}
