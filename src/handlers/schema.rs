//! JSON-Schema sanitation for schema-strict upstreams.
//!
//! Gemini's function-declaration schema accepts only a small, rigid subset
//! of JSON Schema and rejects the whole request on any stray keyword. The
//! sanitizer reduces arbitrary tool schemas to that subset: a single string
//! `type` at every node, `description`/`enum`/`required` passed through, and
//! recursion limited to `properties` and `items`. Everything else —
//! references, composition keywords, formats, numeric and length
//! constraints — is dropped.

use serde_json::{Map, Value};

/// Keys preserved at every node. Anything absent from this list is dropped.
const ALLOWED_KEYS: &[&str] = &["type", "description", "enum", "properties", "items", "required"];

/// Sanitize a schema fragment. Idempotent: sanitizing twice yields the same
/// value as sanitizing once.
pub fn sanitize_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return Value::Object(single_type("string"));
    };

    let mut out = Map::new();
    out.insert("type".into(), Value::String(normalize_type(obj)));

    if let Some(Value::String(description)) = obj.get("description") {
        out.insert("description".into(), Value::String(description.clone()));
    }
    if let Some(Value::Array(values)) = obj.get("enum") {
        out.insert("enum".into(), Value::Array(values.clone()));
    }
    if let Some(Value::Array(required)) = obj.get("required") {
        out.insert("required".into(), Value::Array(required.clone()));
    }
    if let Some(Value::Object(properties)) = obj.get("properties") {
        let sanitized: Map<String, Value> = properties
            .iter()
            .map(|(name, sub)| (name.clone(), sanitize_schema(sub)))
            .collect();
        out.insert("properties".into(), Value::Object(sanitized));
    }
    if let Some(items) = obj.get("items") {
        out.insert("items".into(), sanitize_schema(items));
    }

    Value::Object(out)
}

fn single_type(kind: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("type".into(), Value::String(kind.into()));
    map
}

/// Collapse `type` to a single string. Arrays like `["string","null"]` keep
/// the first non-null entry; a missing type is inferred from structure.
fn normalize_type(obj: &Map<String, Value>) -> String {
    match obj.get("type") {
        Some(Value::String(kind)) if kind != "null" => kind.clone(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|k| *k != "null")
            .unwrap_or("string")
            .to_string(),
        _ => {
            if obj.contains_key("properties") {
                "object".to_string()
            } else if obj.contains_key("items") {
                "array".to_string()
            } else {
                "string".to_string()
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
