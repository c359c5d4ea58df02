//! Sensitive-key masking for logged inputs and loop history.
//!
//! A key is sensitive when it contains any of the marker substrings,
//! case-insensitively. Masked values are replaced wholesale; nested maps
//! are walked recursively so a sensitive key anywhere in the tree is never
//! logged in full.

use serde_json::Value;

/// Substrings that mark a key as sensitive.
pub const SENSITIVE_KEY_MARKERS: [&str; 7] = [
    "token",
    "password",
    "secret",
    "api_key",
    "apikey",
    "auth",
    "credential",
];

/// Replacement for masked values.
pub const MASKED: &str = "***";

/// Whether a key should be masked before logging.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Return a copy of `value` with every sensitive key's value replaced by
/// [`MASKED`]. Arrays are walked; non-container values are returned as-is.
pub fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let masked = map
                .iter()
                .map(|(key, val)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String(MASKED.to_string()))
                    } else {
                        (key.clone(), mask_sensitive(val))
                    }
                })
                .collect();
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

/// Convenience wrapper for masking an output/input map.
pub fn mask_map(map: &serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    match mask_sensitive(&Value::Object(map.clone())) {
        Value::Object(masked) => masked,
        _ => unreachable!("masking an object yields an object"),
    }
}
