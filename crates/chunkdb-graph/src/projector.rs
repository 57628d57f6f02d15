//! Extracted node/relationship graphs, materialized next to the chunks of an index.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use chunkdb_core::types::Scalar;
use chunkdb_core::{Error, Result};

use crate::cypher::{ident, INDEX_PROPERTY, REGISTRY_LABEL};
use crate::executor::{scalar, CypherExecutor, Statement};

pub const DEFAULT_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Scalar>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self { id: id.into(), label: label.into(), properties: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRelationship {
    pub source_id: String,
    pub source_label: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub target_id: String,
    pub target_label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Scalar>,
}

impl GraphRelationship {
    pub fn new(source: &GraphNode, rel_type: impl Into<String>, target: &GraphNode) -> Self {
        Self {
            source_id: source.id.clone(),
            source_label: source.label.clone(),
            rel_type: rel_type.into(),
            target_id: target.id.clone(),
            target_label: target.label.clone(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub relationships: Vec<GraphRelationship>,
}

impl GraphDocument {
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() && self.relationships.is_empty() }
}

fn props_json(properties: &BTreeMap<String, Scalar>) -> Value {
    Value::Object(properties.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Neo4j property type name -> JSON-Schema type.
fn json_type(neo4j_types: &Value) -> Value {
    let first =
        neo4j_types.as_array().and_then(|t| t.first()).and_then(Value::as_str).unwrap_or("String");
    match first {
        "Long" | "Double" | "Integer" | "Float" => json!({ "type": "number" }),
        "Boolean" => json!({ "type": "boolean" }),
        t if t.ends_with("Array") => json!({ "type": "array", "items": { "type": "string" } }),
        _ => json!({ "type": "string" }),
    }
}

/// Labels and relationship types come back as ":`Name`"; keep just the name.
fn bare_name(raw: &str) -> String { raw.trim_start_matches(':').trim_matches('`').to_string() }

pub struct GraphProjector {
    executor: Arc<dyn CypherExecutor>,
    delete_batch: usize,
}

impl GraphProjector {
    pub fn new(executor: Arc<dyn CypherExecutor>) -> Self {
        Self { executor, delete_batch: DEFAULT_DELETE_BATCH }
    }

    #[must_use]
    pub fn with_delete_batch(mut self, batch: usize) -> Self {
        self.delete_batch = batch.max(1);
        self
    }

    /// Merge nodes by `(label, id)` and relationships by `(source, type, target)`.
    /// Every node is tagged with `index_name` so `drop_data` can find it.
    pub async fn add_graph(&self, index_name: &str, graph: &GraphDocument) -> Result<()> {
        let mut nodes: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for node in &graph.nodes {
            if node.id.is_empty() || node.label.is_empty() {
                return Err(Error::InvalidRequest("graph nodes need an id and a label".into()));
            }
            nodes
                .entry(node.label.as_str())
                .or_default()
                .push(json!({ "id": node.id, "props": props_json(&node.properties) }));
        }
        for (label, rows) in nodes {
            self.executor
                .run(
                    Statement::new(format!(
                        "UNWIND $rows AS row \
                         MERGE (n:{} {{id: row.id}}) \
                         SET n += row.props, n.{INDEX_PROPERTY} = $index",
                        ident(label)
                    ))
                    .with_params(json!({ "rows": rows, "index": index_name })),
                )
                .await?;
            debug!(index = %index_name, %label, "graph nodes merged");
        }

        let mut rels: BTreeMap<(&str, &str, &str), Vec<Value>> = BTreeMap::new();
        for rel in &graph.relationships {
            if rel.rel_type.is_empty() {
                return Err(Error::InvalidRequest("graph relationships need a type".into()));
            }
            let key = (rel.source_label.as_str(), rel.rel_type.as_str(), rel.target_label.as_str());
            rels.entry(key).or_default().push(json!({
                "source": rel.source_id,
                "target": rel.target_id,
                "props": props_json(&rel.properties),
            }));
        }
        for ((source, rel_type, target), rows) in rels {
            self.executor
                .run(
                    Statement::new(format!(
                        "UNWIND $rows AS row \
                         MATCH (s:{} {{id: row.source}}) \
                         MATCH (t:{} {{id: row.target}}) \
                         MERGE (s)-[r:{}]->(t) \
                         SET r += row.props",
                        ident(source),
                        ident(target),
                        ident(rel_type)
                    ))
                    .with_params(json!({ "rows": rows })),
                )
                .await?;
        }
        info!(
            index = %index_name,
            nodes = graph.nodes.len(),
            relationships = graph.relationships.len(),
            "graph added"
        );
        Ok(())
    }

    /// Delete every node tagged with `index_name` (optionally one label only),
    /// one bounded transaction at a time. Returns the number removed.
    pub async fn drop_data(&self, index_name: &str, node_label: Option<&str>) -> Result<u64> {
        let pattern =
            node_label.map_or_else(|| "(n)".to_string(), |label| format!("(n:{})", ident(label)));
        let statement = format!(
            "MATCH {pattern} WHERE n.{INDEX_PROPERTY} = $index \
             WITH n LIMIT $batch \
             DETACH DELETE n \
             RETURN count(*) AS removed"
        );
        let mut total = 0u64;
        loop {
            let params = json!({ "index": index_name, "batch": self.delete_batch });
            let rows =
                self.executor.run(Statement::new(statement.clone()).with_params(params)).await?;
            let removed = scalar(&rows, "removed").and_then(Value::as_u64).unwrap_or(0);
            total += removed;
            if removed < self.delete_batch as u64 {
                break;
            }
        }
        info!(
            index = %index_name,
            label = node_label.unwrap_or("*"),
            removed = total,
            "graph data dropped"
        );
        Ok(total)
    }

    /// Live node and relationship property types as a JSON-Schema document:
    /// one definition per label/type, referenced from `properties`.
    pub async fn get_schema(&self) -> Result<Value> {
        let mut definitions: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

        let node_rows = self
            .executor
            .run(Statement::new(
                "CALL db.schema.nodeTypeProperties() YIELD nodeLabels, propertyName, propertyTypes \
                 RETURN nodeLabels, propertyName, propertyTypes",
            ))
            .await?;
        for row in &node_rows {
            let labels =
                row.get("nodeLabels").and_then(Value::as_array).cloned().unwrap_or_default();
            for label in labels.iter().filter_map(Value::as_str) {
                if label == REGISTRY_LABEL {
                    continue;
                }
                let props = definitions.entry(label.to_string()).or_default();
                if let Some(name) = row.get("propertyName").and_then(Value::as_str) {
                    let types = row.get("propertyTypes").unwrap_or(&Value::Null);
                    props.insert(name.to_string(), json_type(types));
                }
            }
        }

        let rel_rows = self
            .executor
            .run(Statement::new(
                "CALL db.schema.relTypeProperties() YIELD relType, propertyName, propertyTypes \
                 RETURN relType, propertyName, propertyTypes",
            ))
            .await?;
        for row in &rel_rows {
            let Some(rel_type) = row.get("relType").and_then(Value::as_str).map(bare_name) else {
                continue;
            };
            let props = definitions.entry(rel_type).or_default();
            if let Some(name) = row.get("propertyName").and_then(Value::as_str) {
                let types = row.get("propertyTypes").unwrap_or(&Value::Null);
                props.insert(name.to_string(), json_type(types));
            }
        }

        let properties: Map<String, Value> = definitions
            .keys()
            .map(|name| (name.clone(), json!({ "$ref": format!("#/definitions/{name}") })))
            .collect();
        let definitions: Map<String, Value> = definitions
            .into_iter()
            .map(|(name, props)| (name, json!({ "type": "object", "properties": props })))
            .collect();
        Ok(json!({ "type": "object", "properties": properties, "definitions": definitions }))
    }
}
