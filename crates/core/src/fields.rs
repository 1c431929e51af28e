//! Dotted field paths over JSON attribute maps.
//!
//! Paths address nested mappings only: `spec.template.spec.containers`
//! names the containers list, never an element inside it.

use serde_json::{Map, Value};

use crate::types::Attributes;

/// Split a dotted path into its segments, skipping empty ones.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Join a parent path and a child segment.
pub fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

/// Look up a field in an attribute map.
pub fn get<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut parts = segments(path);
    let first = parts.next()?;
    parts.try_fold(attributes.get(first)?, |current, part| {
        current.as_object().and_then(|map| map.get(part))
    })
}

/// Look up a field in an arbitrary JSON value.
pub fn get_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(value, |current, part| {
        current.as_object().and_then(|map| map.get(part))
    })
}

/// Set a field, creating intermediate mappings as needed.
///
/// # Errors
///
/// Returns the offending prefix when an intermediate segment exists but is
/// not a mapping.
pub fn set(attributes: &mut Attributes, path: &str, value: Value) -> Result<(), String> {
    let parts: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = parts.split_last() else {
        return Err("empty field path".to_string());
    };

    let mut current: &mut Map<String, Value> = attributes;
    let mut walked = String::new();
    for part in parents {
        walked = join(&walked, part);
        let entry = current
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| format!("'{walked}' is not a mapping"))?;
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

/// Mutable lookup of a field in an attribute map.
pub fn get_mut<'a>(attributes: &'a mut Attributes, path: &str) -> Option<&'a mut Value> {
    let mut parts = segments(path);
    let first = parts.next()?;
    parts.try_fold(attributes.get_mut(first)?, |current, part| {
        current.as_object_mut().and_then(|map| map.get_mut(part))
    })
}

/// Set a label under `metadata.labels`.
///
/// Label keys are stored verbatim, so keys containing dots
/// (`app.kubernetes.io/name`) are not split into path segments.
///
/// # Errors
///
/// Returns an error when `metadata` or `metadata.labels` is not a mapping.
pub fn set_label(attributes: &mut Attributes, key: &str, value: &str) -> Result<(), String> {
    let metadata = attributes
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| "'metadata' is not a mapping".to_string())?;
    let labels = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| "'metadata.labels' is not a mapping".to_string())?;
    labels.insert(key.to_string(), Value::String(value.to_string()));
    Ok(())
}

/// Remove a field if present, returning the old value.
pub fn remove(attributes: &mut Attributes, path: &str) -> Option<Value> {
    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = parts.split_last()?;
    let mut current: &mut Map<String, Value> = attributes;
    for part in parents {
        current = current.get_mut(*part)?.as_object_mut()?;
    }
    current.remove(*last)
}
