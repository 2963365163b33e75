//! Canonical JSON serialization and content hashing.
//!
//! One routine is shared by hashing and storage so the hashed bytes and the
//! stored bytes cannot diverge: objects are key-sorted recursively and
//! serialized compactly (no whitespace).

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::PipelineError;

/// Serializes a JSON value with recursively sorted object keys and compact
/// separators. Identical values always produce identical bytes.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when serialization fails (e.g. a
/// non-finite float smuggled in through `serde_json::Number`).
pub fn canonical_json(value: &Value) -> Result<String, PipelineError> {
    serde_json::to_string(&sort_keys(value))
        .map_err(|err| PipelineError::Validation(format!("canonical serialization failed: {err}")))
}

/// Lowercase hex SHA-256 of a UTF-8 string.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Canonical hash of a JSON value: `sha256_hex(canonical_json(value))`.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when canonicalization fails.
pub fn canonical_hash(value: &Value) -> Result<String, PipelineError> {
    Ok(sha256_hex(&canonical_json(value)?))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

            // serde_json preserves insertion order, so inserting in sorted
            // order yields sorted serialization.
            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key.clone(), sort_keys(inner));
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

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [ {"k": 2, "a": 1} ]}});
        assert_eq!(
            must_ok(canonical_json(&value)),
            r#"{"a":{"m":[{"a":1,"k":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_is_insertion_order_independent() {
        let first = json!({"alpha": 1, "beta": [1, 2, 3]});
        let second = json!({"beta": [1, 2, 3], "alpha": 1});
        assert_eq!(
            must_ok(canonical_json(&first)),
            must_ok(canonical_json(&second))
        );
        assert_eq!(
            must_ok(canonical_hash(&first)),
            must_ok(canonical_hash(&second))
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
