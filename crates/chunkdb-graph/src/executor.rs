//! Cypher execution seam.
//!
//! The store and projector only build statements; a [`CypherExecutor`] runs
//! them. [`crate::http::Neo4jHttp`] is the production executor, tests swap in
//! a recording fake.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use chunkdb_core::Result;

/// One result row keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub statement: String,
    pub parameters: Value,
}

impl Statement {
    pub fn new(statement: impl Into<String>) -> Self {
        Self { statement: statement.into(), parameters: Value::Object(Map::new()) }
    }

    #[must_use]
    pub fn with_params(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[async_trait]
pub trait CypherExecutor: Send + Sync {
    /// Run one statement in its own auto-committed transaction.
    async fn run(&self, statement: Statement) -> Result<Vec<Row>>;

    async fn close(&self) -> Result<()> { Ok(()) }
}

/// First column value of the first row, if any.
pub fn scalar<'a>(rows: &'a [Row], column: &str) -> Option<&'a Value> {
    rows.first().and_then(|r| r.get(column))
}
