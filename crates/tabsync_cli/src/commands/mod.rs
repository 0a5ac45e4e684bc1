//! CLI command implementations.

pub mod changes;
pub mod inspect;
pub mod watch;
pub mod write;

use std::path::{Path, PathBuf};
use tabsync_core::Database;
use tabsync_storage::Value;

/// Opens an existing store directory.
pub fn open_existing(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    Ok(Database::open(path)?)
}

/// Returns the signal directory of a store.
pub fn signal_dir(path: &Path) -> PathBuf {
    path.join("signals")
}

/// Converts JSON to a store value. Floats are rejected.
pub fn json_to_value(json: &serde_json::Value) -> Result<Value, String> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Integer(
            n.as_i64()
                .ok_or_else(|| format!("unsupported number {n}: only integers are stored"))?,
        ),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(
            items
                .iter()
                .map(json_to_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        serde_json::Value::Object(fields) => Value::map(
            fields
                .iter()
                .map(|(k, v)| Ok((Value::Text(k.clone()), json_to_value(v)?)))
                .collect::<Result<Vec<_>, String>>()?,
        ),
    })
}

/// Converts a store value to JSON. Bytes become a hex string and non-text
/// map keys are rendered as JSON text.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::from(*n),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => {
            serde_json::Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(pairs) => serde_json::Value::Object(
            pairs
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::Text(s) => s.clone(),
                        other => value_to_json(other).to_string(),
                    };
                    (key, value_to_json(v))
                })
                .collect(),
        ),
    }
}

/// Parses a row key: JSON if it parses, plain text otherwise.
pub fn parse_key(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => json_to_value(&json),
        Err(_) => Ok(Value::Text(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion() {
        let json = json!({"title": "notes", "tags": ["a", "b"], "pinned": true, "n": 3, "x": null});
        let value = json_to_value(&json).unwrap();
        assert_eq!(value.get("title"), Some(&Value::from("notes")));
        assert_eq!(value.get("n"), Some(&Value::Integer(3)));
        assert_eq!(value_to_json(&value), json);
    }

    #[test]
    fn floats_are_rejected() {
        assert!(json_to_value(&json!(1.5)).is_err());
    }

    #[test]
    fn keys() {
        assert_eq!(parse_key("42").unwrap(), Value::Integer(42));
        assert_eq!(parse_key("\"42\"").unwrap(), Value::from("42"));
        assert_eq!(parse_key("note-1").unwrap(), Value::from("note-1"));
    }

    #[test]
    fn bytes_render_as_hex() {
        assert_eq!(value_to_json(&Value::Bytes(vec![0, 255])), json!("00ff"));
    }
}
