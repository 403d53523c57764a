//! Canonical serialization of JSON-like values.
//!
//! Canonicalization is deterministic: object keys are sorted, array order
//! is preserved, scalars are printed as JSON. `undefined` (modeled as
//! `serde_json::Value::Null` from a caller that distinguishes the two) is
//! not special-cased here — callers that need the sentinel should filter
//! it out before calling `canonicalize`, matching how task/step inputs are
//! built from already-JSON-shaped values.

use serde_json::Value;

/// Render `value` as a canonical JSON string: object keys sorted
/// recursively, everything else printed in its natural JSON form.
///
/// Two values that are structurally equal (ignoring object key order)
/// canonicalize to the same string. This is the basis for stable task
/// keys (`crate::key::compute_key`) and for deduplicating dispatches.
pub fn canonicalize(value: &Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).expect("serde_json::Value always serializes")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": 1, "y": 2}});
        assert_eq!(canonicalize(&value), r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn preserves_array_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonicalize(&value), "[3,1,2]");
    }

    #[test]
    fn key_order_does_not_affect_output() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }
}
