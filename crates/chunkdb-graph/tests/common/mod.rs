#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

use chunkdb_core::Result;
use chunkdb_graph::{CypherExecutor, Row, Statement};

/// Executor that records every statement and answers from scripted rules.
/// One-shot rules are consumed in order before sticky rules are consulted;
/// anything unmatched returns no rows.
#[derive(Default)]
pub struct FakeExecutor {
    once: Mutex<Vec<(String, Vec<Row>)>>,
    sticky: Mutex<Vec<(String, Vec<Row>)>>,
    calls: Mutex<Vec<Statement>>,
}

impl FakeExecutor {
    pub fn respond(&self, fragment: &str, rows: Vec<Row>) {
        self.sticky.lock().unwrap().push((fragment.to_string(), rows));
    }

    pub fn respond_once(&self, fragment: &str, rows: Vec<Row>) {
        self.once.lock().unwrap().push((fragment.to_string(), rows));
    }

    pub fn calls(&self) -> Vec<Statement> { self.calls.lock().unwrap().clone() }

    pub fn calls_matching(&self, fragment: &str) -> Vec<Statement> {
        self.calls().into_iter().filter(|s| s.statement.contains(fragment)).collect()
    }
}

#[async_trait]
impl CypherExecutor for FakeExecutor {
    async fn run(&self, statement: Statement) -> Result<Vec<Row>> {
        let text = statement.statement.clone();
        self.calls.lock().unwrap().push(statement);
        {
            let mut once = self.once.lock().unwrap();
            let hit = once.iter().position(|(fragment, _)| text.contains(fragment.as_str()));
            if let Some(pos) = hit {
                return Ok(once.remove(pos).1);
            }
        }
        let sticky = self.sticky.lock().unwrap();
        Ok(sticky
            .iter()
            .find(|(fragment, _)| text.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("row must be an object, got {other}"),
    }
}

pub const REGISTRATION_LOOKUP: &str = "{name: $name}) RETURN properties(r)";

pub fn registration(name: &str, dimension: usize) -> Row {
    row(json!({
        "r": {
            "name": name,
            "nativeName": format!("{}_vector", name.replace('-', "_")),
            "textIndex": format!("{}_text", name.replace('-', "_")),
            "nodeLabel": "Chunk",
            "embeddingProperty": "embedding",
            "dimension": dimension,
            "similarity": "cosine",
            "schema": "null"
        }
    }))
}

pub fn node(id: &str, text: &str, category: &str, score: f64) -> Row {
    row(json!({
        "props": {
            "id": id,
            "nodeLabel": "Chunk",
            "text": text,
            "data.category": category,
            "indexName": "docs-v1",
            "embedding": [1.0, 0.0, 0.0, 0.0]
        },
        "score": score
    }))
}
