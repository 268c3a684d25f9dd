//! Conversion between JSON payloads and Firestore values.
//!
//! Integers that fit in `i64` travel as `integerValue`; other numbers as
//! `doubleValue`. Timestamps, bytes and references come back as plain
//! strings, geo points as `{latitude, longitude}` objects.

use std::collections::HashMap;

use serde_json::{Map, Number, Value as Json};

use crmdata_models::Payload;

use crate::transport::RemoteDocument;
use crate::types::{ArrayValue, Document, MapValue, Value};

/// Convert a JSON value to a Firestore value.
pub fn json_to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::NullValue(()),
        Json::Bool(b) => Value::BooleanValue(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::IntegerValue(i.to_string()),
            None => Value::DoubleValue(n.as_f64().unwrap_or(0.0)),
        },
        Json::String(s) => Value::StringValue(s.clone()),
        Json::Array(items) => Value::ArrayValue(ArrayValue {
            values: Some(items.iter().map(json_to_value).collect()),
        }),
        Json::Object(map) => Value::MapValue(MapValue {
            fields: Some(payload_to_fields(map)),
        }),
    }
}

/// Convert a Firestore value to JSON.
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::NullValue(()) => Json::Null,
        Value::BooleanValue(b) => Json::Bool(*b),
        Value::IntegerValue(s) => s
            .parse::<i64>()
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(s.clone())),
        Value::DoubleValue(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::TimestampValue(s)
        | Value::StringValue(s)
        | Value::BytesValue(s)
        | Value::ReferenceValue(s) => Json::String(s.clone()),
        Value::GeoPointValue(point) => {
            let mut map = Map::new();
            map.insert("latitude".to_string(), Json::from(point.latitude));
            map.insert("longitude".to_string(), Json::from(point.longitude));
            Json::Object(map)
        }
        Value::ArrayValue(array) => Json::Array(
            array
                .values
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(value_to_json)
                .collect(),
        ),
        Value::MapValue(map) => Json::Object(
            map.fields
                .as_ref()
                .map(fields_to_payload)
                .unwrap_or_default(),
        ),
    }
}

pub fn payload_to_fields(payload: &Payload) -> HashMap<String, Value> {
    payload
        .iter()
        .map(|(k, v)| (k.clone(), json_to_value(v)))
        .collect()
}

pub fn fields_to_payload(fields: &HashMap<String, Value>) -> Payload {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), value_to_json(v)))
        .collect()
}

/// Convert a REST document into the transport representation.
pub fn document_to_remote(doc: Document) -> RemoteDocument {
    let id = doc.doc_id().unwrap_or_default().to_string();
    let fields = doc
        .fields
        .as_ref()
        .map(fields_to_payload)
        .unwrap_or_default();

    RemoteDocument {
        id,
        fields,
        update_time: doc.update_time,
    }
}
