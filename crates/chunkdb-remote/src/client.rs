//! REST client for the remote search service.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use chunkdb_core::config::RemoteSettings;
use chunkdb_core::types::SimilarityMetric;
use chunkdb_core::{Error, Result};

pub(crate) const BACKEND: &str = "remote";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub key: bool,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<SimilarityMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
}

impl IndexDefinition {
    /// The vector field, if the index has one.
    pub fn vector_field(&self) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.dimensions.is_some())
    }

    pub fn dimension(&self) -> Option<usize> { self.vector_field().and_then(|f| f.dimensions) }

    pub fn similarity(&self) -> SimilarityMetric {
        self.vector_field().and_then(|f| f.similarity).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexStats {
    #[serde(default)]
    document_count: u64,
}

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

/// Body of `POST /indexes/{name}/docs/search`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub top: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

fn transport_error(err: &reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::transient(BACKEND, err.to_string())
    } else {
        Error::backend(BACKEND, err.to_string())
    }
}

async fn status_error(response: Response, subject: &str) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(subject.to_string()),
        StatusCode::CONFLICT => Error::AlreadyExists(subject.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::InvalidConfig(format!("remote service rejected the api key ({status})"))
        }
        StatusCode::BAD_REQUEST => Error::InvalidRequest(format!("{subject}: {text}")),
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            Error::transient(BACKEND, format!("{status} on {subject}: {text}"))
        }
        _ => Error::backend(BACKEND, format!("{status} on {subject}: {text}")),
    }
}

/// One pooled HTTP client per store; requests carry the `api-key` header.
#[derive(Clone)]
pub struct RemoteClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RemoteClient {
    pub fn new(settings: &RemoteSettings, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("remote http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String { format!("{}{path}", self.endpoint) }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, subject: &str) -> Result<Response> {
        let response = self.authed(builder).send().await.map_err(|e| transport_error(&e))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response, subject).await)
        }
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder, subject: &str) -> Result<T> {
        self.send(builder, subject).await?.json().await.map_err(|e| transport_error(&e))
    }

    pub async fn put_index(&self, definition: &IndexDefinition) -> Result<()> {
        let path = format!("/indexes/{}", definition.name);
        self.send(self.client.put(self.url(&path)).json(definition), &definition.name).await?;
        Ok(())
    }

    pub async fn delete_index(&self, name: &str) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/indexes/{name}"))), name).await?;
        Ok(())
    }

    pub async fn get_index(&self, name: &str) -> Result<IndexDefinition> {
        self.json(self.client.get(self.url(&format!("/indexes/{name}"))), name).await
    }

    pub async fn list_indexes(&self) -> Result<Vec<IndexDefinition>> {
        let list: ValueList<IndexDefinition> =
            self.json(self.client.get(self.url("/indexes")), "indexes").await?;
        Ok(list.value)
    }

    pub async fn document_count(&self, name: &str) -> Result<u64> {
        let path = format!("/indexes/{name}/stats");
        let stats: IndexStats = self.json(self.client.get(self.url(&path)), name).await?;
        Ok(stats.document_count)
    }

    /// One bulk request; every document carries its own `@action`.
    pub async fn index_documents(&self, name: &str, documents: &[Value]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let path = format!("/indexes/{name}/docs/index");
        let request = self.client.post(self.url(&path)).json(&json!({ "value": documents }));
        self.send(request, name).await?;
        debug!(index = %name, count = documents.len(), "bulk request sent");
        Ok(())
    }

    pub async fn search(&self, name: &str, body: &SearchBody) -> Result<Vec<Value>> {
        let path = format!("/indexes/{name}/docs/search");
        let list: ValueList<Value> =
            self.json(self.client.post(self.url(&path)).json(body), name).await?;
        Ok(list.value)
    }

    pub async fn lookup(&self, name: &str, ids: &[String]) -> Result<Vec<Value>> {
        let path = format!("/indexes/{name}/docs/lookup");
        let request = self.client.post(self.url(&path)).json(&json!({ "ids": ids }));
        let list: ValueList<Value> = self.json(request, name).await?;
        Ok(list.value)
    }
}
