//! JSON-Schema chunk descriptor -> backend field-type map.
//!
//! Descriptors look like `{ "properties": {...}, "definitions": {...}, "$ref": ... }`.
//! Properties that point into `definitions` through `$ref` (or carry inline
//! `properties`) are flattened under a dotted prefix. Reference chains are
//! followed with a visited-set guard, so cyclic definitions terminate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{DEFAULT_EMBEDDING_PROPERTY, DEFAULT_NODE_LABEL};

/// Backend-neutral field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Categorical, matched by exact equality.
    Exact,
    FullText,
    Vector,
    Numeric,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedSchema {
    pub fields: BTreeMap<String, FieldKind>,
}

impl ProjectedSchema {
    pub fn get(&self, field: &str) -> Option<FieldKind> { self.fields.get(field).copied() }

    pub fn contains(&self, field: &str) -> bool { self.fields.contains_key(field) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Non-vector fields, i.e. everything a filter can address.
    pub fn scalar_fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.iter().filter(|(_, kind)| *kind != FieldKind::Vector)
    }

    pub fn len(&self) -> usize { self.fields.len() }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
}

#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    pub node_label: String,
    pub vector_field: String,
    pub separator: String,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            node_label: DEFAULT_NODE_LABEL.to_string(),
            vector_field: DEFAULT_EMBEDDING_PROPERTY.to_string(),
            separator: crate::flatten::DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl ProjectionOptions {
    pub fn for_label(node_label: impl Into<String>, vector_field: impl Into<String>) -> Self {
        Self { node_label: node_label.into(), vector_field: vector_field.into(), ..Self::default() }
    }
}

/// Fields every `Chunk`-labelled index carries regardless of the descriptor.
const CHUNK_SYSTEM_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::Exact),
    ("nodeLabel", FieldKind::Exact),
    ("type", FieldKind::Exact),
    ("documentId", FieldKind::Exact),
    ("text", FieldKind::FullText),
    ("metadata.author", FieldKind::FullText),
    ("metadata.mimetype", FieldKind::Exact),
    ("metadata.objectName", FieldKind::FullText),
    ("metadata.endpoint", FieldKind::Exact),
    ("metadata.database", FieldKind::Exact),
    ("metadata.subtype", FieldKind::Exact),
    ("metadata.parentIds", FieldKind::Exact),
    ("metadata.page", FieldKind::Numeric),
    ("metadata.row", FieldKind::Numeric),
    ("metadata.wordCount", FieldKind::Numeric),
    ("metadata.length", FieldKind::Numeric),
    ("metadata.size", FieldKind::Numeric),
    ("createdDateTime", FieldKind::Exact),
    ("createdBy", FieldKind::Exact),
    ("startDateTime", FieldKind::Exact),
    ("endDateTime", FieldKind::Exact),
    ("version", FieldKind::Numeric),
];

pub fn project_schema(descriptor: &Value, options: &ProjectionOptions) -> Result<ProjectedSchema> {
    let mut projector = Projector { options, definitions: None, fields: BTreeMap::new() };
    match descriptor {
        Value::Null => {}
        Value::Object(root) => {
            projector.definitions =
                root.get("definitions").or_else(|| root.get("$defs")).and_then(Value::as_object);
            let mut visited = Vec::new();
            let root = match root.get("$ref") {
                Some(reference) if !root.contains_key("properties") => {
                    let name = ref_name(reference)?;
                    visited.push(name.to_string());
                    projector.definition(name)?
                }
                _ => root,
            };
            if let Some(properties) = root.get("properties").and_then(Value::as_object) {
                projector.walk(properties, "", &mut visited)?;
            }
        }
        other => {
            return Err(Error::InvalidRequest(format!(
                "schema descriptor must be an object, got {other}"
            )));
        }
    }

    let mut fields = projector.fields;
    if options.node_label == DEFAULT_NODE_LABEL {
        let sep = &options.separator;
        for (path, kind) in CHUNK_SYSTEM_FIELDS {
            fields.entry(path.replace('.', sep)).or_insert(*kind);
        }
        fields.entry(options.vector_field.clone()).or_insert(FieldKind::Vector);
    }
    Ok(ProjectedSchema { fields })
}

struct Projector<'a> {
    options: &'a ProjectionOptions,
    definitions: Option<&'a Map<String, Value>>,
    fields: BTreeMap<String, FieldKind>,
}

impl<'a> Projector<'a> {
    fn definition(&self, name: &str) -> Result<&'a Map<String, Value>> {
        self.definitions
            .and_then(|defs| defs.get(name))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                Error::InvalidRequest(format!("schema reference to unknown definition '{name}'"))
            })
    }

    fn walk(
        &mut self,
        properties: &'a Map<String, Value>,
        prefix: &str,
        visited: &mut Vec<String>,
    ) -> Result<()> {
        for (name, property) in properties {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}{}{name}", self.options.separator)
            };

            if let Some(reference) = property.get("$ref") {
                let target = ref_name(reference)?;
                if visited.iter().any(|v| v == target) {
                    warn!(field = %path, definition = target, "cyclic schema reference skipped");
                    continue;
                }
                let definition = self.definition(target)?;
                if let Some(nested) = definition.get("properties").and_then(Value::as_object) {
                    visited.push(target.to_string());
                    self.walk(nested, &path, visited)?;
                    visited.pop();
                } else {
                    self.fields.insert(path.clone(), self.classify(name, &path, definition));
                }
                continue;
            }

            match property.get("properties").and_then(Value::as_object) {
                Some(nested) if type_of(property) == Some("object") || !nested.is_empty() => {
                    self.walk(nested, &path, visited)?;
                }
                _ => {
                    if let Some(object) = property.as_object() {
                        let kind = self.classify(name, &path, object);
                        self.fields.insert(path, kind);
                    }
                }
            }
        }
        Ok(())
    }

    fn classify(&self, name: &str, path: &str, property: &Map<String, Value>) -> FieldKind {
        if name == "id" {
            return FieldKind::Exact;
        }
        if name == self.options.vector_field || path == self.options.vector_field {
            return FieldKind::Vector;
        }
        match property.get("type").and_then(first_type) {
            Some("string") => FieldKind::FullText,
            Some("boolean") => FieldKind::Exact,
            Some("number" | "integer") => FieldKind::Numeric,
            _ => FieldKind::FullText,
        }
    }
}

fn type_of(property: &Value) -> Option<&str> { property.get("type").and_then(first_type) }

/// `"type"` may be a string or a list such as `["string", "null"]`.
fn first_type(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items.iter().filter_map(Value::as_str).find(|t| *t != "null"),
        _ => None,
    }
}

fn ref_name(reference: &Value) -> Result<&str> {
    let raw = reference
        .as_str()
        .ok_or_else(|| Error::InvalidRequest(format!("$ref must be a string, got {reference}")))?;
    Ok(raw
        .strip_prefix("#/definitions/")
        .or_else(|| raw.strip_prefix("#/$defs/"))
        .unwrap_or(raw))
}
