//! Partial-object filter matching for the event matcher (§4.5).
//!
//! A `wait_filter` is a partial JSON object: each leaf names a value the
//! matching event's `input` must equal at that path. Container nodes
//! (nested objects and arrays) are checked only for *type* — an object
//! filter node requires an object at the same path, an array filter node
//! requires an array, but neither recurses into array elements. Scalar
//! leaves (string/number/bool/null) are checked for equality.
//!
//! An empty object filter (`{}`, the default) matches any object input.

use serde_json::Value;

/// Does `input` satisfy `filter`, per the partial-object rules above?
pub fn matches_filter(filter: &Value, input: &Value) -> bool {
    match filter {
        Value::Object(filter_map) => match input {
            Value::Object(input_map) => filter_map
                .iter()
                .all(|(k, v)| input_map.get(k).is_some_and(|iv| matches_filter(v, iv))),
            _ => false,
        },
        Value::Array(_) => matches!(input, Value::Array(_)),
        scalar => scalar == input,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_filter_matches_any_object() {
        assert!(matches_filter(&json!({}), &json!({"num": 42})));
        assert!(matches_filter(&json!({}), &json!({})));
    }

    #[test]
    fn empty_filter_rejects_non_object_input() {
        assert!(!matches_filter(&json!({}), &json!(42)));
    }

    #[test]
    fn scalar_leaf_requires_equality() {
        assert!(matches_filter(&json!({"num": 42}), &json!({"num": 42, "extra": 1})));
        assert!(!matches_filter(&json!({"num": 42}), &json!({"num": -1})));
    }

    #[test]
    fn missing_key_does_not_match() {
        assert!(!matches_filter(&json!({"num": 42}), &json!({"other": 1})));
    }

    #[test]
    fn nested_object_filters_recurse() {
        assert!(matches_filter(
            &json!({"a": {"b": 1}}),
            &json!({"a": {"b": 1, "c": 2}})
        ));
        assert!(!matches_filter(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}})));
    }

    #[test]
    fn array_filter_nodes_check_type_only() {
        assert!(matches_filter(&json!({"tags": [1, 2]}), &json!({"tags": [9, 9, 9]})));
        assert!(!matches_filter(&json!({"tags": [1, 2]}), &json!({"tags": "not-an-array"})));
    }
}
