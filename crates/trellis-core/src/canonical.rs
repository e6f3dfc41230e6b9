//! Canonical JSON encoding for content addressing.
//!
//! A change blob must hash to the same ID on every replica, so its
//! canonical encoding is compact JSON with object keys sorted
//! lexicographically at every nesting level. Arrays keep element order.

use serde_json::Value;

/// Encode a [`serde_json::Value`] as canonical JSON bytes.
///
/// Keys at every object level are sorted; output contains no whitespace.
#[must_use]
pub fn to_canonical_json(value: &Value) -> Vec<u8> {
    let mut buf = String::new();
    write_value(value, &mut buf);
    buf.into_bytes()
}

fn write_value(value: &Value, buf: &mut String) {
    match value {
        Value::Null => buf.push_str("null"),
        Value::Bool(true) => buf.push_str("true"),
        Value::Bool(false) => buf.push_str("false"),
        Value::Number(n) => buf.push_str(&n.to_string()),
        Value::String(s) => write_string(s, buf),
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_value(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_string(key, buf);
                buf.push(':');
                if let Some(val) = map.get(*key) {
                    write_value(val, buf);
                }
            }
            buf.push('}');
        }
    }
}

fn write_string(s: &str, buf: &mut String) {
    // serde_json string escaping is infallible for valid UTF-8.
    match serde_json::to_string(s) {
        Ok(escaped) => buf.push_str(&escaped),
        Err(_) => buf.push_str("\"\""),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
