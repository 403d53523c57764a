//! Stable task/step keys from canonical input.

use md5::{Digest, Md5};

use crate::value::canonicalize;

/// Threshold (in bytes of the canonical string) above which we fall back
/// to an MD5 hex digest instead of the raw canonical serialization.
///
/// Collision resistance is not security-sensitive here — only
/// determinism is required, so MD5 is an acceptable, cheap choice.
const INLINE_KEY_THRESHOLD: usize = 40;

/// Compute the stable key for a task or step input.
///
/// If the canonical serialization is under [`INLINE_KEY_THRESHOLD`] bytes
/// it is used verbatim (so short, human-legible inputs produce readable
/// keys); otherwise the key is the MD5 hex digest of the canonical form.
pub fn compute_key(input: &serde_json::Value) -> String {
    let canonical = canonicalize(input);
    if canonical.len() <= INLINE_KEY_THRESHOLD {
        canonical
    } else {
        let mut hasher = Md5::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_input_is_used_verbatim() {
        let key = compute_key(&json!({"a": 1}));
        assert_eq!(key, r#"{"a":1}"#);
    }

    #[test]
    fn long_input_falls_back_to_md5_hex() {
        let long = json!({"a": "x".repeat(100)});
        let key = compute_key(&long);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_inputs_produce_identical_keys_regardless_of_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(compute_key(&a), compute_key(&b));
    }
}
