//! Chunk <-> remote document mapping and OData-style filters.
//!
//! A document is the chunk flattened with `__`, every key prefixed by its node
//! label (`Chunk__data__category`), plus the unprefixed key `id`, the
//! `nodeLabel` and the `vector`. Several labels can share one index that way.

use serde_json::{json, Map, Value};

use chunkdb_core::filter::{attribute_path, Criteria};
use chunkdb_core::flatten::{chunk_from_flat, chunk_to_flat, namespace, strip_namespace, FlatRecord};
use chunkdb_core::schema::{FieldKind, ProjectedSchema};
use chunkdb_core::types::{Chunk, LogicalType, Scalar, SimilarityMetric};
use chunkdb_core::{Error, Result};

use crate::client::{FieldDefinition, BACKEND};

pub const SEPARATOR: &str = "__";
pub const KEY_FIELD: &str = "id";
pub const LABEL_FIELD: &str = "nodeLabel";
pub const VECTOR_FIELD: &str = "vector";
pub const SCORE_FIELD: &str = "@score";
const ACTION_FIELD: &str = "@action";

/// Flat paths stored as string collections.
const LIST_PATHS: &[&str] = &["metadata__parentIds"];

pub fn field_name(label: &str, path: &str) -> String {
    format!("{label}{SEPARATOR}{}", path.replace('.', SEPARATOR))
}

pub fn upload_document(chunk: &Chunk, label: &str, vector: Option<&[f32]>) -> Result<Value> {
    let mut stored = chunk.without_embedding();
    stored.node_label = label.to_string();
    let flat = namespace(chunk_to_flat(&stored, SEPARATOR)?, label, SEPARATOR);
    let mut doc: Map<String, Value> = flat.into_iter().filter(|(_, v)| !v.is_null()).collect();
    doc.insert(ACTION_FIELD.into(), json!("upload"));
    doc.insert(KEY_FIELD.into(), json!(chunk.id));
    doc.insert(LABEL_FIELD.into(), json!(label));
    if let Some(vector) = vector {
        doc.insert(VECTOR_FIELD.into(), json!(vector));
    }
    Ok(Value::Object(doc))
}

pub fn delete_document(id: &str) -> Value { json!({ "@action": "delete", "id": id }) }

/// A search hit or lookup result back into a chunk, with its `@score` if any.
pub fn document_to_chunk(doc: &Value) -> Result<(Option<f32>, Chunk)> {
    let Value::Object(map) = doc else {
        return Err(Error::backend(BACKEND, format!("expected a document object, got {doc}")));
    };
    let label = map
        .get(LABEL_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::backend(BACKEND, "document without nodeLabel"))?;
    let flat: FlatRecord = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let mut chunk = chunk_from_flat(&strip_namespace(flat, label, SEPARATOR), SEPARATOR)?;
    chunk.embedding = map.get(VECTOR_FIELD).and_then(|v| serde_json::from_value(v.clone()).ok());
    #[allow(clippy::cast_possible_truncation)]
    let score = map.get(SCORE_FIELD).and_then(Value::as_f64).map(|s| s as f32);
    Ok((score, chunk))
}

/// Index fields for one label: the key, label and vector fields plus every
/// projected scalar field under the label prefix.
pub fn field_definitions(
    label: &str,
    projected: &ProjectedSchema,
    dimension: usize,
    similarity: SimilarityMetric,
) -> Vec<FieldDefinition> {
    let plain = |name: &str, field_type: &str| FieldDefinition {
        name: name.to_string(),
        field_type: field_type.to_string(),
        key: false,
        searchable: false,
        filterable: true,
        dimensions: None,
        similarity: None,
    };
    let mut fields = vec![
        FieldDefinition { key: true, ..plain(KEY_FIELD, "Edm.String") },
        plain(LABEL_FIELD, "Edm.String"),
        FieldDefinition {
            filterable: false,
            dimensions: Some(dimension),
            similarity: Some(similarity),
            ..plain(VECTOR_FIELD, "Collection(Edm.Single)")
        },
    ];
    for (path, kind) in projected.scalar_fields() {
        let name = field_name(label, path);
        let list = LIST_PATHS.contains(&path.replace('.', SEPARATOR).as_str());
        let field = match kind {
            FieldKind::Numeric => plain(&name, "Edm.Double"),
            FieldKind::FullText => {
                FieldDefinition { searchable: true, ..plain(&name, "Edm.String") }
            }
            _ if list => plain(&name, "Collection(Edm.String)"),
            _ => plain(&name, "Edm.String"),
        };
        fields.push(field);
    }
    fields
}

fn literal(value: &Scalar) -> String {
    match value {
        Scalar::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.render(),
    }
}

/// Attribute conditions as a filter expression over `label`'s fields.
/// Text terms are not part of it; the service matches them through `search`.
pub fn attribute_filter(criteria: &Criteria<'_>, label: &str) -> Option<String> {
    let parts: Vec<String> = criteria
        .attrs
        .iter()
        .map(|(key, value)| {
            let path = attribute_path(key).replace('.', SEPARATOR);
            let field = format!("{label}{SEPARATOR}{path}");
            if LIST_PATHS.contains(&path.as_str()) {
                format!("{field}/any(v: v eq {})", literal(value))
            } else {
                format!("{field} eq {}", literal(value))
            }
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    let joiner = match criteria.logical {
        LogicalType::And => " and ",
        LogicalType::Or => " or ",
    };
    Some(parts.join(joiner))
}
