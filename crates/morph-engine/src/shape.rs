//! Structural fingerprint of a unit's declared interface.
//!
//! Only key names and coarse value kinds feed the hash, so typing into an
//! input does not trigger re-authoring, but adding a key, changing a value's
//! type, or going from empty to non-empty does.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Coarse kind of a JSON value.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(s) if s.is_empty() => "string:empty",
        Value::String(_) => "string",
        Value::Array(a) if a.is_empty() => "array:empty",
        Value::Array(_) => "array",
        Value::Object(o) if o.is_empty() => "object:empty",
        Value::Object(_) => "object",
    }
}

/// Human-readable `key: kind` lines, sorted by key.
pub fn describe_inputs(inputs: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = inputs.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{k}: {}", value_kind(&inputs[k.as_str()])))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fingerprint(inputs: &Map<String, Value>, tools: &[String], handlers: &[String]) -> String {
    let mut tools = tools.to_vec();
    tools.sort();
    tools.dedup();
    let mut handlers = handlers.to_vec();
    handlers.sort();
    handlers.dedup();

    let mut hasher = Sha256::new();
    hasher.update(b"inputs\n");
    hasher.update(describe_inputs(inputs).as_bytes());
    hasher.update(b"\ntools\n");
    hasher.update(tools.join("\n").as_bytes());
    hasher.update(b"\nhandlers\n");
    hasher.update(handlers.join("\n").as_bytes());

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
