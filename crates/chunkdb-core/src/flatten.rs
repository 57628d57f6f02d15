//! Nested record <-> flat dotted-key record codec.
//!
//! Schema-constrained backends (Arrow columns, Tantivy fields, Neo4j
//! properties, the remote service) only store flat records. `flatten` joins
//! nested object keys with a separator; `unflatten` is its exact inverse for
//! every record without arrays of objects.
//!
//! Leaves are scalars, `null`, arrays of scalars and empty objects. Arrays of
//! objects are rejected rather than silently mangled.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::Chunk;

pub const DEFAULT_SEPARATOR: &str = ".";

pub type FlatRecord = BTreeMap<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlattenError {
    #[error("flatten expects a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error(
        "field '{key}' holds an array of objects, which cannot be flattened; pre-serialize it"
    )]
    ObjectArray { key: String },

    #[error("flat key '{key}' conflicts with a value already stored at '{existing}'")]
    PathConflict { key: String, existing: String },

    #[error("empty key segment in '{0}'")]
    EmptySegment(String),

    #[error("key '{key}' is empty or contains the separator '{separator}'")]
    InvalidKey { key: String, separator: String },
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn flatten(value: &Value, separator: &str) -> Result<FlatRecord, FlattenError> {
    let Value::Object(map) = value else {
        return Err(FlattenError::NotAnObject(kind_name(value)));
    };
    let mut out = FlatRecord::new();
    flatten_into(map, "", separator, &mut out)?;
    Ok(out)
}

fn flatten_into(
    map: &Map<String, Value>,
    prefix: &str,
    sep: &str,
    out: &mut FlatRecord,
) -> Result<(), FlattenError> {
    for (key, value) in map {
        // A key that is empty or holds the separator would unflatten into a different shape.
        if key.is_empty() || key.contains(sep) {
            let key = if prefix.is_empty() { key.clone() } else { format!("{prefix}{sep}{key}") };
            return Err(FlattenError::InvalidKey { key, separator: sep.to_string() });
        }
        let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}{sep}{key}") };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(inner, &path, sep, out)?,
            Value::Array(items) if items.iter().any(Value::is_object) => {
                return Err(FlattenError::ObjectArray { key: path });
            }
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
    Ok(())
}

pub fn unflatten(flat: &FlatRecord, separator: &str) -> Result<Value, FlattenError> {
    let mut root = Map::new();
    for (key, value) in flat {
        let segments: Vec<&str> = key.split(separator).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(FlattenError::EmptySegment(key.clone()));
        }
        insert_path(&mut root, &segments, value.clone(), key)?;
    }
    Ok(Value::Object(root))
}

fn insert_path(
    node: &mut Map<String, Value>,
    segments: &[&str],
    value: Value,
    full_key: &str,
) -> Result<(), FlattenError> {
    let conflict = |existing: &str| FlattenError::PathConflict {
        key: full_key.to_string(),
        existing: existing.to_string(),
    };
    match segments {
        [] => Ok(()),
        [head] => {
            if node.contains_key(*head) {
                return Err(conflict(head));
            }
            node.insert((*head).to_string(), value);
            Ok(())
        }
        [head, rest @ ..] => {
            let child = node
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(inner) => insert_path(inner, rest, value, full_key),
                _ => Err(conflict(head)),
            }
        }
    }
}

/// Prefix every key with `label` so several node labels can share one index.
pub fn namespace(flat: FlatRecord, label: &str, separator: &str) -> FlatRecord {
    flat.into_iter().map(|(k, v)| (format!("{label}{separator}{k}"), v)).collect()
}

/// Keep only keys under `label` and remove the prefix.
pub fn strip_namespace(flat: FlatRecord, label: &str, separator: &str) -> FlatRecord {
    let prefix = format!("{label}{separator}");
    flat.into_iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v)))
        .collect()
}

pub fn chunk_to_flat(chunk: &Chunk, separator: &str) -> crate::Result<FlatRecord> {
    let value = serde_json::to_value(chunk)?;
    Ok(flatten(&value, separator)?)
}

pub fn chunk_from_flat(flat: &FlatRecord, separator: &str) -> crate::Result<Chunk> {
    let value = unflatten(flat, separator)?;
    Ok(serde_json::from_value(value)?)
}
