//! Domain types shared by every backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

pub type ChunkId = String;
pub type Attributes = BTreeMap<String, Scalar>;

pub const DEFAULT_NODE_LABEL: &str = "Chunk";
pub const DEFAULT_EMBEDDING_PROPERTY: &str = "embedding";
pub const DEFAULT_K: usize = 10;

/// Keys of [`ChunkMetadata`] as they appear on the wire.
pub const METADATA_FIELDS: &[&str] = &[
    "author",
    "mimetype",
    "objectName",
    "endpoint",
    "database",
    "subtype",
    "parentIds",
    "page",
    "row",
    "wordCount",
    "length",
    "size",
];

/// Top-level [`Chunk`] keys that are addressable as filter attributes.
pub const CHUNK_FIELDS: &[&str] = &[
    "id",
    "nodeLabel",
    "documentId",
    "type",
    "text",
    "createdDateTime",
    "createdBy",
    "startDateTime",
    "endDateTime",
    "version",
];

/// A typed scalar stored in `Chunk::data` and used in equality filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Scalar {
    /// Canonical string form. Backends that index scalars as raw terms store
    /// and query this exact rendering so equality is preserved.
    pub fn render(&self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => render_number(*n),
            Scalar::String(s) => s.clone(),
        }
    }

    pub fn from_json(value: &Value) -> Option<Scalar> {
        match value {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Scalar::Number),
            Value::String(s) => Some(Scalar::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Number(n) => {
                serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
            }
            Scalar::String(s) => Value::String(s.clone()),
        }
    }

    /// Equality against a stored JSON value. Arrays match when any element does.
    pub fn matches_json(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Array(items)) => items.iter().any(|v| self.matches_json(v)),
            (Scalar::Bool(a), Value::Bool(b)) => a == b,
            (Scalar::Number(a), Value::Number(b)) => {
                b.as_f64().is_some_and(|b| (a - b).abs() < f64::EPSILON)
            }
            (Scalar::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self { Scalar::String(s.to_string()) }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self { Scalar::String(s) }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self { Scalar::Number(n) }
}

impl From<i64> for Scalar {
    #[allow(clippy::cast_precision_loss)]
    fn from(n: i64) -> Self { Scalar::Number(n as f64) }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self { Scalar::Bool(b) }
}

#[allow(clippy::cast_possible_truncation)]
fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Structured provenance bag attached to every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Ordered; a chunk may hang under several parents.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parent_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl ChunkMetadata {
    pub fn is_empty(&self) -> bool { *self == ChunkMetadata::default() }
}

fn default_node_label() -> String { DEFAULT_NODE_LABEL.to_string() }

/// The atomic indexed unit: text, an optional embedding and typed metadata.
///
/// The SCD Type 2 fields (`created_*`, `start_date_time`, `end_date_time`,
/// `version`) are carried as-is; closing out prior versions is left to the
/// caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: ChunkId,
    #[serde(default = "default_node_label")]
    pub node_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: Attributes,
    #[serde(default, skip_serializing_if = "ChunkMetadata::is_empty")]
    pub metadata: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl Chunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_label: default_node_label(),
            document_id: None,
            kind: None,
            text: text.into(),
            embedding: None,
            data: Attributes::new(),
            metadata: ChunkMetadata::default(),
            created_date_time: None,
            created_by: None,
            start_date_time: None,
            end_date_time: None,
            version: None,
        }
    }

    #[must_use]
    pub fn with_node_label(mut self, label: impl Into<String>) -> Self {
        self.node_label = label.into();
        self
    }

    #[must_use]
    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The same chunk without its vector; used where vectors live in a
    /// dedicated column and the stored source must stay compact.
    #[must_use]
    pub fn without_embedding(&self) -> Self {
        Self { embedding: None, ..self.clone() }
    }
}

/// Pair each chunk with the vector that will be written for it.
///
/// Explicit `embeddings` override the chunks' own vectors and must line up
/// one-to-one with `chunks`.
pub fn pair_embeddings<'a>(
    chunks: &'a [Chunk],
    embeddings: Option<&'a [Vec<f32>]>,
) -> Result<Vec<(&'a Chunk, Option<&'a [f32]>)>> {
    match embeddings {
        Some(vectors) if vectors.len() != chunks.len() => Err(Error::InvalidRequest(format!(
            "got {} embeddings for {} chunks",
            vectors.len(),
            chunks.len()
        ))),
        Some(vectors) => {
            Ok(chunks.iter().zip(vectors.iter().map(Vec::as_slice).map(Some)).collect())
        }
        None => Ok(chunks.iter().map(|c| (c, c.embedding.as_deref())).collect()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Dot,
    Euclidean,
}

impl SimilarityMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::Dot => "dot",
            SimilarityMetric::Euclidean => "euclidean",
        }
    }

    /// Map a vector-database distance onto a higher-is-better similarity.
    pub fn distance_to_similarity(self, distance: f32) -> f32 {
        match self {
            SimilarityMetric::Cosine | SimilarityMetric::Dot => 1.0 - distance,
            SimilarityMetric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for SimilarityMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "dot" | "dot_product" | "dotproduct" => Ok(SimilarityMetric::Dot),
            "euclidean" | "l2" => Ok(SimilarityMetric::Euclidean),
            other => Err(Error::InvalidRequest(format!("unknown similarity metric '{other}'"))),
        }
    }
}

/// Which backend owns an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProvider {
    Vector,
    Text,
    Graph,
    Remote,
}

impl BackendProvider {
    pub const ALL: [BackendProvider; 4] = [
        BackendProvider::Vector,
        BackendProvider::Text,
        BackendProvider::Graph,
        BackendProvider::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendProvider::Vector => "vector",
            BackendProvider::Text => "text",
            BackendProvider::Graph => "graph",
            BackendProvider::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for BackendProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vector" | "lancedb" => Ok(BackendProvider::Vector),
            "text" | "tantivy" => Ok(BackendProvider::Text),
            "graph" | "neo4j" => Ok(BackendProvider::Graph),
            "remote" => Ok(BackendProvider::Remote),
            other => Err(Error::InvalidRequest(format!("unknown backend provider '{other}'"))),
        }
    }
}

/// Everything a backend needs to create an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    #[serde(default)]
    pub schema: Value,
    #[serde(default = "default_node_label")]
    pub node_label: String,
    pub embedding_dimension: usize,
    #[serde(default = "default_embedding_property")]
    pub embedding_property: String,
    #[serde(default)]
    pub similarity: SimilarityMetric,
}

fn default_embedding_property() -> String { DEFAULT_EMBEDDING_PROPERTY.to_string() }

impl IndexSpec {
    pub fn new(name: impl Into<String>, embedding_dimension: usize) -> Self {
        Self {
            name: name.into(),
            schema: Value::Null,
            node_label: default_node_label(),
            embedding_dimension,
            embedding_property: default_embedding_property(),
            similarity: SimilarityMetric::Cosine,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn with_node_label(mut self, label: impl Into<String>) -> Self {
        self.node_label = label.into();
        self
    }

    #[must_use]
    pub fn with_similarity(mut self, similarity: SimilarityMetric) -> Self {
        self.similarity = similarity;
        self
    }

    #[must_use]
    pub fn with_embedding_property(mut self, property: impl Into<String>) -> Self {
        self.embedding_property = property.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_index_name(&self.name)?;
        if self.embedding_dimension == 0 {
            return Err(Error::InvalidRequest(format!(
                "index '{}' needs a non-zero embedding dimension",
                self.name
            )));
        }
        if self.node_label.trim().is_empty() {
            return Err(Error::InvalidRequest(format!("index '{}' needs a node label", self.name)));
        }
        Ok(())
    }
}

/// Index names become directory names, table names and URL segments.
pub fn validate_index_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "invalid index name '{name}': use 1-128 ASCII letters, digits, '-' or '_'"
        )))
    }
}

/// Returned by a successful `create_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHandle {
    pub name: String,
    pub provider: BackendProvider,
    /// Name of the index inside the backend; differs from `name` when the
    /// backend names indexes on its own (Neo4j vector indexes).
    pub native_name: String,
}

/// Live index description; `document_count` is always fetched, never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub provider: BackendProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimension: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<SimilarityMetric>,
    pub document_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteParams {
    pub index_name: String,
    pub node_label: Option<String>,
    pub batch_size: Option<usize>,
}

impl WriteParams {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self { index_name: index_name.into(), node_label: None, batch_size: None }
    }

    #[must_use]
    pub fn with_node_label(mut self, label: impl Into<String>) -> Self {
        self.node_label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Node label a chunk is written under; the explicit one wins.
    pub fn label_for<'a>(&'a self, chunk: &'a Chunk) -> &'a str {
        self.node_label.as_deref().unwrap_or(&chunk.node_label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteParams {
    pub index_name: String,
}

impl DeleteParams {
    pub fn new(index_name: impl Into<String>) -> Self { Self { index_name: index_name.into() } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "keyword" | "text" | "fulltext" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::InvalidRequest(format!("unknown search mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    #[default]
    And,
    Or,
}

/// A normalized query, translated by each backend into its native form.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index_name: String,
    pub query_text: Option<String>,
    pub attrs: Attributes,
    pub logical_type: LogicalType,
    pub k: usize,
    pub query_embedding: Option<Vec<f32>>,
    pub mode: Option<SearchMode>,
}

impl SearchRequest {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            query_text: None,
            attrs: Attributes::new(),
            logical_type: LogicalType::And,
            k: DEFAULT_K,
            query_embedding: None,
            mode: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_logical(mut self, logical: LogicalType) -> Self {
        self.logical_type = logical;
        self
    }

    #[must_use]
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Query text with surrounding whitespace removed, `None` when blank.
    pub fn text(&self) -> Option<&str> {
        self.query_text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Explicit mode, or the one implied by which inputs are present.
    pub fn effective_mode(&self) -> SearchMode {
        if let Some(mode) = self.mode {
            return mode;
        }
        match (self.text().is_some(), self.query_embedding.is_some()) {
            (false, true) => SearchMode::Vector,
            (true, true) => SearchMode::Hybrid,
            _ => SearchMode::Keyword,
        }
    }

    /// The embedding, or an error when the mode needs one.
    pub fn require_embedding(&self) -> Result<&[f32]> {
        self.query_embedding
            .as_deref()
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "{:?} search needs a query embedding",
                    self.effective_mode()
                ))
            })
    }
}

/// Whether a score is a similarity (higher is better) or a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    Similarity,
    Distance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f32,
    pub score_kind: ScoreKind,
}

impl ScoredChunk {
    pub fn similarity(chunk: Chunk, score: f32) -> Self {
        Self { chunk, score, score_kind: ScoreKind::Similarity }
    }

    pub fn distance(chunk: Chunk, score: f32) -> Self {
        Self { chunk, score, score_kind: ScoreKind::Distance }
    }

    /// Score as a similarity regardless of how the backend reported it.
    pub fn similarity_score(&self, metric: SimilarityMetric) -> f32 {
        match self.score_kind {
            ScoreKind::Similarity => self.score,
            ScoreKind::Distance => metric.distance_to_similarity(self.score),
        }
    }

    #[must_use]
    pub fn into_similarity(self, metric: SimilarityMetric) -> Self {
        let score = self.similarity_score(metric);
        Self { chunk: self.chunk, score, score_kind: ScoreKind::Similarity }
    }
}
