//! Dotted-path access over a nested string-keyed value tree.
//!
//! Paths split on `.`; there is no escaping, so keys containing a dot
//! cannot be addressed individually.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::error::ContextError;

/// The shared context tree. Leaves are scalars or lists; interior nodes
/// are maps keyed by path segment.
pub type Document = Map<String, Value>;

/// Reads the value at `path`, deserialized into `T`.
///
/// Fails with `KeyMissing` when any segment does not resolve and with
/// `KeyTypeMismatch` when the final value is not assignable to `T`.
pub fn get<T: DeserializeOwned>(doc: &Document, path: &str) -> Result<T, ContextError> {
    if path.is_empty() {
        return Err(ContextError::EmptyPath);
    }

    let segments: Vec<&str> = path.split('.').collect();
    let last = segments.len() - 1;
    let mut it = doc;

    for key in &segments[..last] {
        match it.get(*key).and_then(Value::as_object) {
            Some(next) => it = next,
            None => {
                return Err(ContextError::KeyMissing {
                    path: path.to_string(),
                })
            }
        }
    }

    let value = it.get(segments[last]).ok_or_else(|| ContextError::KeyMissing {
        path: path.to_string(),
    })?;

    serde_json::from_value(value.clone()).map_err(|_| ContextError::KeyTypeMismatch {
        path: path.to_string(),
        expected: short_type_name::<T>(),
        found: value_kind(value).to_string(),
    })
}

/// Stores `value` at `path`, creating interior maps as needed. Returns
/// `true` when an existing value was replaced along the way. A null
/// intermediate is treated like an absent one and silently becomes a map;
/// any other non-map intermediate is overwritten and reported as replaced.
pub fn set(doc: &mut Document, path: &str, value: Value) -> bool {
    if path.is_empty() {
        return false;
    }

    let segments: Vec<&str> = path.split('.').collect();
    let last = segments.len() - 1;
    let mut replaced = false;
    let mut it = doc;

    for key in &segments[..last] {
        let slot = it
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            if !slot.is_null() {
                replaced = true;
            }
            *slot = Value::Object(Map::new());
        }
        it = slot
            .as_object_mut()
            .expect("intermediate slot was just normalized to a map");
    }

    if it.insert(segments[last].to_string(), value).is_some() {
        replaced = true;
    }

    replaced
}

/// Removes the value at `path`. Returns `false` when the path does not
/// fully resolve.
pub fn delete(doc: &mut Document, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    let segments: Vec<&str> = path.split('.').collect();
    let last = segments.len() - 1;
    let mut it = doc;

    for key in &segments[..last] {
        match it.get_mut(*key).and_then(Value::as_object_mut) {
            Some(next) => it = next,
            None => return false,
        }
    }

    it.remove(segments[last]).is_some()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn short_type_name<T>() -> String {
    std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("value")
        .to_string()
}
