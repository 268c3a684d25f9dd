//! Document payloads.
//!
//! Payloads travel through the cache, the write queue and the transport as
//! JSON objects; typed values are converted at the façade boundary.

use serde_json::{Map, Value};

/// Field map of a single document.
pub type Payload = Map<String, Value>;

/// Shallow merge: every top-level field of `patch` replaces the same field of
/// `base`.
pub fn merge_payload(base: &mut Payload, patch: &Payload) {
    for (field, value) in patch {
        base.insert(field.clone(), value.clone());
    }
}
