//! JSON merge patch (RFC 7386) generation
//!
//! Patches are applied with `json_patch::merge`.

use serde_json::{Map, Value};

/// Compute the merge patch that turns `before` into `after`.
///
/// Returns `None` when the two documents are equal. Objects are diffed
/// recursively, keys missing from `after` become `null`, and arrays or
/// scalars are replaced wholesale.
pub fn diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for (key, old) in b {
                match a.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        if let Some(p) = diff(old, new) {
                            patch.insert(key.clone(), p);
                        }
                    }
                }
            }
            for (key, new) in a {
                if !b.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}

/// Restrict a patch to one top-level field, e.g. `status`
pub fn select(patch: Option<Value>, field: &str) -> Option<Value> {
    let value = patch?.get(field)?.clone();
    let mut out = Map::new();
    out.insert(field.to_string(), value);
    Some(Value::Object(out))
}

/// Drop one top-level field from a patch
pub fn without(patch: Option<Value>, field: &str) -> Option<Value> {
    match patch? {
        Value::Object(mut obj) => {
            obj.remove(field);
            if obj.is_empty() {
                None
            } else {
                Some(Value::Object(obj))
            }
        }
        other => Some(other),
    }
}
