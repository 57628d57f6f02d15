//! Cypher text helpers and chunk <-> node property mapping.

use serde_json::{Map, Value};

use chunkdb_core::filter::{attribute_path, Criteria};
use chunkdb_core::flatten::{chunk_to_flat, unflatten, FlatRecord, DEFAULT_SEPARATOR};
use chunkdb_core::types::{Chunk, LogicalType};
use chunkdb_core::{Error, Result};

/// Property every chunk and projected node carries.
pub const INDEX_PROPERTY: &str = "indexName";
/// Set on chunk nodes only; projected entities share `indexName` but not this.
pub const CHUNK_MARKER: &str = "isChunk";
pub const REGISTRY_LABEL: &str = "_ChunkDbIndex";

/// Dotted paths whose stored value is a list.
const LIST_PROPERTIES: &[&str] = &["metadata.parentIds"];

/// Backtick-quote a label, relationship type or property key.
pub fn ident(name: &str) -> String { format!("`{}`", name.replace('`', "``")) }

/// `WHERE` condition selecting the chunk nodes of `$index` bound to `var`.
pub fn chunk_scope(var: &str) -> String {
    format!("{var}.{INDEX_PROPERTY} = $index AND {var}.{CHUNK_MARKER} = true")
}

/// Node properties for a chunk: the flat record minus nulls and empty
/// objects (Neo4j cannot store either), tagged with the index name and the
/// chunk marker.
pub fn chunk_properties(chunk: &Chunk, index_name: &str) -> Result<Map<String, Value>> {
    let flat = chunk_to_flat(&chunk.without_embedding(), DEFAULT_SEPARATOR)?;
    let mut props: Map<String, Value> = flat
        .into_iter()
        .filter(|(_, v)| !v.is_null() && !matches!(v, Value::Object(_)))
        .collect();
    props.insert(INDEX_PROPERTY.to_string(), Value::String(index_name.to_string()));
    props.insert(CHUNK_MARKER.to_string(), Value::Bool(true));
    Ok(props)
}

/// Rebuild a chunk from `properties(node)`.
pub fn node_to_chunk(props: &Value, embedding_property: &str) -> Result<Chunk> {
    let Value::Object(map) = props else {
        return Err(Error::backend("neo4j", format!("expected node properties, got {props}")));
    };
    let mut flat = FlatRecord::new();
    let mut embedding = None;
    for (key, value) in map {
        if key == INDEX_PROPERTY || key == CHUNK_MARKER {
            continue;
        }
        if key == embedding_property {
            embedding = serde_json::from_value::<Vec<f32>>(value.clone()).ok();
            continue;
        }
        flat.insert(key.clone(), value.clone());
    }
    let mut chunk: Chunk = serde_json::from_value(unflatten(&flat, DEFAULT_SEPARATOR)?)?;
    chunk.embedding = embedding;
    Ok(chunk)
}

/// A `WHERE` fragment over `var` plus its parameters. Like every native
/// filter here it may over-select; callers refine with [`Criteria::matches`].
pub fn criteria_clause(
    criteria: &Criteria<'_>,
    var: &str,
) -> (Option<String>, Map<String, Value>) {
    let mut params = Map::new();
    let mut parts = Vec::new();
    if !criteria.terms.is_empty() {
        params.insert("terms".into(), Value::from(criteria.terms.clone()));
        parts.push(format!(
            "any(t IN $terms WHERE toLower(coalesce({var}.text, '')) CONTAINS t)"
        ));
    }
    for (i, (key, value)) in criteria.attrs.iter().enumerate() {
        let path = attribute_path(key);
        let param = format!("a{i}");
        let property = format!("{var}.{}", ident(&path));
        if LIST_PROPERTIES.contains(&path.as_str()) {
            parts.push(format!("${param} IN coalesce({property}, [])"));
        } else {
            parts.push(format!("{property} = ${param}"));
        }
        params.insert(param, value.to_json());
    }
    if parts.is_empty() {
        return (None, params);
    }
    let joiner = match criteria.logical {
        LogicalType::And => " AND ",
        LogicalType::Or => " OR ",
    };
    (Some(format!("({})", parts.join(joiner))), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdb_core::types::{Attributes, Scalar};
    use serde_json::json;

    #[test]
    fn properties_round_trip_through_node_shape() {
        let mut chunk = Chunk::new("c1", "hello")
            .with_data("category", "faq")
            .with_embedding(vec![0.5, 0.5]);
        chunk.metadata.parent_ids = vec!["p".into()];
        let mut props = chunk_properties(&chunk, "docs").expect("props");
        assert_eq!(props.get("data.category"), Some(&json!("faq")));
        assert_eq!(props.get(INDEX_PROPERTY), Some(&json!("docs")));
        assert_eq!(props.get(CHUNK_MARKER), Some(&json!(true)));
        assert!(!props.contains_key("embedding"));
        props.insert("embedding".into(), json!([0.5, 0.5]));
        let back = node_to_chunk(&Value::Object(props), "embedding").expect("chunk");
        assert_eq!(back, chunk);
    }

    #[test]
    fn criteria_clause_quotes_dotted_paths() {
        let mut attrs = Attributes::new();
        attrs.insert("category".into(), Scalar::from("faq"));
        attrs.insert("parentIds".into(), Scalar::from("p1"));
        let criteria = Criteria::new(None, &attrs, LogicalType::Or);
        let (clause, params) = criteria_clause(&criteria, "n");
        assert_eq!(
            clause.as_deref(),
            Some("(n.`data.category` = $a0 OR $a1 IN coalesce(n.`metadata.parentIds`, []))")
        );
        assert_eq!(params.get("a1"), Some(&json!("p1")));
    }
}
