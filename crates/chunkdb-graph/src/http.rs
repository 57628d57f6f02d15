use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use chunkdb_core::config::Neo4jSettings;
use chunkdb_core::{Error, Result};

use crate::executor::{CypherExecutor, Row, Statement};

const BACKEND: &str = "neo4j";

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    columns: Vec<String>,
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Executor over the Neo4j HTTP transactional endpoint
/// (`POST {url}/db/{database}/tx/commit`).
pub struct Neo4jHttp {
    client: Client,
    commit_url: String,
    user: String,
    password: String,
}

impl Neo4jHttp {
    pub fn new(settings: &Neo4jSettings, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("neo4j http client: {e}")))?;
        let commit_url =
            format!("{}/db/{}/tx/commit", settings.url.trim_end_matches('/'), settings.database);
        Ok(Self {
            client,
            commit_url,
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }
}

fn transport_error(err: &reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::transient(BACKEND, err.to_string())
    } else {
        Error::backend(BACKEND, err.to_string())
    }
}

fn cypher_error(err: &TxError) -> Error {
    let message = format!("{}: {}", err.code, err.message);
    if err.code.starts_with("Neo.TransientError") {
        Error::transient(BACKEND, message)
    } else if err.code.ends_with("EquivalentSchemaRuleAlreadyExists")
        || err.code.ends_with("IndexAlreadyExists")
    {
        Error::AlreadyExists(err.message.clone())
    } else {
        Error::backend(BACKEND, message)
    }
}

#[async_trait]
impl CypherExecutor for Neo4jHttp {
    async fn run(&self, statement: Statement) -> Result<Vec<Row>> {
        debug!(statement = %statement.statement, "cypher");
        let response = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({ "statements": [statement] }))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::InvalidConfig(format!("neo4j rejected credentials ({status})")));
        }
        if status.is_server_error() {
            return Err(Error::transient(BACKEND, format!("neo4j returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::backend(BACKEND, format!("neo4j returned {status}")));
        }

        let body: TxResponse = response.json().await.map_err(|e| transport_error(&e))?;
        if let Some(err) = body.errors.first() {
            return Err(cypher_error(err));
        }
        let rows = body
            .results
            .into_iter()
            .next()
            .map(|result| {
                result
                    .data
                    .into_iter()
                    .map(|data| result.columns.iter().cloned().zip(data.row).collect::<Row>())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}
