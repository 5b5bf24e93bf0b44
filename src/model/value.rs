//! Property value normalization.
//!
//! Desired and applied properties are compared after normalization so that
//! unordered list properties do not produce spurious updates.

use serde_json::Value;
use std::collections::BTreeMap;

use super::kind::ResourceKind;

/// Property map of a resource.
pub type Properties = BTreeMap<String, Value>;

/// Normalizes a single property value for comparison.
///
/// Object keys are always sorted. Lists are sorted by the canonical encoding
/// of their normalized elements unless the kind declares the property
/// order-sensitive, in which case list order is kept at every depth.
#[must_use]
pub fn normalize_property(kind: ResourceKind, property: &str, value: &Value) -> Value {
    normalize(value, kind.is_order_sensitive(property))
}

/// Normalizes every property of a map.
#[must_use]
pub fn normalize_properties(kind: ResourceKind, properties: &Properties) -> Properties {
    properties
        .iter()
        .map(|(name, value)| (name.clone(), normalize_property(kind, name, value)))
        .collect()
}

/// Returns true if two values of `property` are equal after normalization.
#[must_use]
pub fn property_eq(kind: ResourceKind, property: &str, left: &Value, right: &Value) -> bool {
    normalize_property(kind, property, left) == normalize_property(kind, property, right)
}

/// Deterministic text encoding of a value.
#[must_use]
pub fn canonical(value: &Value) -> String {
    // serde_json maps are ordered by key, so the encoding is stable.
    value.to_string()
}

fn normalize(value: &Value, ordered: bool) -> Value {
    match value {
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().map(|v| normalize(v, ordered)).collect();
            if !ordered {
                normalized.sort_by_cached_key(canonical);
            }
            Value::Array(normalized)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v, ordered)))
                .collect(),
        ),
        other => other.clone(),
    }
}
