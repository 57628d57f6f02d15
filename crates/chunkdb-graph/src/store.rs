//! Neo4j chunk store.
//!
//! Chunks are nodes labelled with their node label, keyed by `(id, indexName)`,
//! with flat dotted property keys and an `isChunk` marker. Each logical index
//! maps to a native vector index plus a fulltext index over `text`; the
//! mapping lives on a registry node so lookups by logical name survive
//! restarts. Several logical indexes may share one native index, which is
//! dropped with the last registration that uses it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use chunkdb_core::config::Neo4jSettings;
use chunkdb_core::filter::{lexical_score, require_criteria, Criteria};
use chunkdb_core::fusion::{fuse, sort_desc};
use chunkdb_core::retry::{with_deadline, CallOptions, RetryPolicy};
use chunkdb_core::similarity::check_dimension;
use chunkdb_core::types::{
    pair_embeddings, Attributes, BackendProvider, Chunk, ChunkId, DeleteParams, IndexHandle,
    IndexInfo, IndexSpec, LogicalType, ScoredChunk, SearchMode, SearchRequest, SimilarityMetric,
    WriteParams,
};
use chunkdb_core::{
    ChunkStore, ChunkWriter, Error, IndexLifecycle, QueryEngine, ReadOutcome, Result,
};

use crate::cypher::{
    chunk_properties, chunk_scope, criteria_clause, ident, node_to_chunk, INDEX_PROPERTY,
    REGISTRY_LABEL,
};
use crate::executor::{scalar, CypherExecutor, Row, Statement};
use crate::http::Neo4jHttp;
use crate::projector::GraphProjector;

const DEFAULT_WRITE_BATCH: usize = 500;
const REFINE_FACTOR: usize = 4;

/// Logical index as recorded on its registry node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub native_name: String,
    pub text_index: String,
    pub node_label: String,
    pub embedding_property: String,
    pub dimension: usize,
    pub similarity: SimilarityMetric,
    /// Schema descriptor as JSON text; Neo4j properties cannot hold maps.
    #[serde(default)]
    pub schema: String,
}

fn native_similarity(metric: SimilarityMetric) -> Result<&'static str> {
    match metric {
        SimilarityMetric::Cosine => Ok("cosine"),
        SimilarityMetric::Euclidean => Ok("euclidean"),
        SimilarityMetric::Dot => Err(Error::Unsupported(
            "neo4j vector indexes support cosine and euclidean only".into(),
        )),
    }
}

fn default_native_name(name: &str) -> String { format!("{}_vector", name.replace('-', "_")) }

fn default_text_index(name: &str) -> String { format!("{}_text", name.replace('-', "_")) }

fn count_of(rows: &[Row], column: &str) -> u64 {
    scalar(rows, column).and_then(Value::as_u64).unwrap_or(0)
}

fn and_clause(clause: Option<String>) -> String {
    clause.map(|c| format!(" AND {c}")).unwrap_or_default()
}

pub struct GraphStore {
    executor: Arc<dyn CypherExecutor>,
    projector: GraphProjector,
    options: CallOptions,
}

impl GraphStore {
    pub fn new(executor: Arc<dyn CypherExecutor>, options: CallOptions) -> Self {
        let projector = GraphProjector::new(executor.clone());
        Self { executor, projector, options }
    }

    /// HTTP-backed store; the client timeout follows the call deadline.
    pub fn connect(settings: &Neo4jSettings, options: CallOptions) -> Result<Self> {
        let executor = Neo4jHttp::new(settings, options.deadline())?;
        info!(url = %settings.url, database = %settings.database, "neo4j store ready");
        Ok(Self::new(Arc::new(executor), options).with_delete_batch(settings.delete_batch_size))
    }

    #[must_use]
    pub fn with_delete_batch(mut self, batch: usize) -> Self {
        self.projector = GraphProjector::new(self.executor.clone()).with_delete_batch(batch);
        self
    }

    /// Graph projection over the same connection.
    pub fn projector(&self) -> &GraphProjector { &self.projector }

    async fn registration(&self, name: &str) -> Result<Registration> {
        let statement = format!(
            "MATCH (r:{} {{name: $name}}) RETURN properties(r) AS r",
            ident(REGISTRY_LABEL)
        );
        let rows = self
            .executor
            .run(Statement::new(statement).with_params(json!({ "name": name })))
            .await?;
        let props = scalar(&rows, "r").ok_or_else(|| Error::NotFound(format!("index '{name}'")))?;
        Ok(serde_json::from_value(props.clone())?)
    }

    async fn registrations(&self) -> Result<Vec<Registration>> {
        let statement = format!(
            "MATCH (r:{}) RETURN properties(r) AS r ORDER BY r.name",
            ident(REGISTRY_LABEL)
        );
        let rows = self.executor.run(Statement::new(statement)).await?;
        rows.iter()
            .filter_map(|row| row.get("r"))
            .map(|props| serde_json::from_value(props.clone()).map_err(Error::from))
            .collect()
    }

    /// Chunk nodes of the index; projected entities are not counted.
    async fn count(&self, registration: &Registration) -> Result<u64> {
        let statement =
            format!("MATCH (n) WHERE {} RETURN count(n) AS total", chunk_scope("n"));
        let rows = self
            .executor
            .run(Statement::new(statement).with_params(json!({ "index": registration.name })))
            .await?;
        Ok(count_of(&rows, "total"))
    }

    async fn info(&self, registration: &Registration) -> Result<IndexInfo> {
        Ok(IndexInfo {
            name: registration.name.clone(),
            provider: BackendProvider::Graph,
            native_name: Some(registration.native_name.clone()),
            node_label: Some(registration.node_label.clone()),
            embedding_dimension: Some(registration.dimension),
            similarity: Some(registration.similarity),
            document_count: self.count(registration).await?,
        })
    }

    /// Existing native vector index with this name or on this label/property.
    async fn existing_vector_index(
        &self,
        native: &str,
        label: &str,
        property: &str,
    ) -> Result<Option<(String, Option<usize>)>> {
        let rows = self
            .executor
            .run(
                Statement::new(
                    "SHOW VECTOR INDEXES YIELD name, labelsOrTypes, properties, options \
                     WHERE name = $native OR ($label IN labelsOrTypes AND $property IN properties) \
                     RETURN name, options",
                )
                .with_params(json!({ "native": native, "label": label, "property": property })),
            )
            .await?;
        let Some(row) = rows.first() else { return Ok(None) };
        let name = row.get("name").and_then(Value::as_str).unwrap_or(native).to_string();
        let dimension = row
            .get("options")
            .and_then(|o| o.pointer("/indexConfig/vector.dimensions"))
            .and_then(Value::as_u64)
            .and_then(|d| usize::try_from(d).ok());
        Ok(Some((name, dimension)))
    }

    /// Existing fulltext index with this name or over `text` of this label.
    /// Neo4j skips creating an equivalent index under a second name.
    async fn existing_fulltext_index(
        &self,
        text_index: &str,
        label: &str,
    ) -> Result<Option<String>> {
        let rows = self
            .executor
            .run(
                Statement::new(
                    "SHOW FULLTEXT INDEXES YIELD name, labelsOrTypes, properties \
                     WHERE name = $text OR (labelsOrTypes = [$label] AND properties = ['text']) \
                     RETURN name",
                )
                .with_params(json!({ "text": text_index, "label": label })),
            )
            .await?;
        Ok(rows.first().and_then(|row| row.get("name")).and_then(Value::as_str).map(str::to_string))
    }

    async fn create_inner(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        spec.validate()?;
        let similarity = native_similarity(spec.similarity)?;
        match self.registration(&spec.name).await {
            Ok(_) => return Err(Error::AlreadyExists(spec.name.clone())),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let label = ident(&spec.node_label);
        let property = ident(&spec.embedding_property);
        let wanted = default_native_name(&spec.name);
        let existing = self
            .existing_vector_index(&wanted, &spec.node_label, &spec.embedding_property)
            .await?;
        let native_name = match existing {
            Some((name, dimension)) => {
                if let Some(actual) = dimension.filter(|d| *d != spec.embedding_dimension) {
                    return Err(Error::DimensionMismatch {
                        index: spec.name.clone(),
                        expected: spec.embedding_dimension,
                        actual,
                    });
                }
                info!(index = %spec.name, native = %name, "reusing existing neo4j vector index");
                name
            }
            None => {
                self.executor
                    .run(Statement::new(format!(
                        "CREATE VECTOR INDEX {} IF NOT EXISTS FOR (n:{label}) ON (n.{property}) \
                         OPTIONS {{indexConfig: {{`vector.dimensions`: {}, \
                         `vector.similarity_function`: '{similarity}'}}}}",
                        ident(&wanted),
                        spec.embedding_dimension
                    )))
                    .await?;
                wanted
            }
        };

        let wanted_text = default_text_index(&spec.name);
        let text_index = match self.existing_fulltext_index(&wanted_text, &spec.node_label).await? {
            Some(name) => {
                info!(index = %spec.name, text = %name, "reusing existing neo4j fulltext index");
                name
            }
            None => {
                self.executor
                    .run(Statement::new(format!(
                        "CREATE FULLTEXT INDEX {} IF NOT EXISTS FOR (n:{label}) ON EACH [n.`text`]",
                        ident(&wanted_text)
                    )))
                    .await?;
                wanted_text
            }
        };

        let registration = Registration {
            name: spec.name.clone(),
            native_name: native_name.clone(),
            text_index,
            node_label: spec.node_label.clone(),
            embedding_property: spec.embedding_property.clone(),
            dimension: spec.embedding_dimension,
            similarity: spec.similarity,
            schema: spec.schema.to_string(),
        };
        let statement =
            format!("MERGE (r:{} {{name: $name}}) SET r += $props", ident(REGISTRY_LABEL));
        self.executor
            .run(
                Statement::new(statement)
                    .with_params(json!({ "name": spec.name, "props": registration })),
            )
            .await?;
        info!(index = %spec.name, native = %native_name, "neo4j index registered");
        Ok(IndexHandle { name: spec.name.clone(), provider: BackendProvider::Graph, native_name })
    }

    /// Other registrations still using this registration's native indexes.
    async fn index_users(&self, registration: &Registration) -> Result<(u64, u64)> {
        let statement = format!(
            "MATCH (r:{}) WHERE r.name <> $name \
             RETURN sum(CASE WHEN r.nativeName = $native THEN 1 ELSE 0 END) AS vectorUsers, \
             sum(CASE WHEN r.textIndex = $text THEN 1 ELSE 0 END) AS textUsers",
            ident(REGISTRY_LABEL)
        );
        let rows = self
            .executor
            .run(Statement::new(statement).with_params(json!({
                "name": registration.name,
                "native": registration.native_name,
                "text": registration.text_index,
            })))
            .await?;
        Ok((count_of(&rows, "vectorUsers"), count_of(&rows, "textUsers")))
    }

    async fn drop_inner(&self, name: &str) -> Result<()> {
        let registration = self.registration(name).await?;
        let (vector_users, text_users) = self.index_users(&registration).await?;
        for (index, users) in
            [(&registration.native_name, vector_users), (&registration.text_index, text_users)]
        {
            if users > 0 {
                debug!(index = %name, native = %index, users, "native index still shared, kept");
                continue;
            }
            let statement = format!("DROP INDEX {} IF EXISTS", ident(index));
            self.executor.run(Statement::new(statement)).await?;
        }
        let removed = self.projector.drop_data(name, None).await?;
        let statement = format!("MATCH (r:{} {{name: $name}}) DELETE r", ident(REGISTRY_LABEL));
        self.executor
            .run(Statement::new(statement).with_params(json!({ "name": name })))
            .await?;
        info!(index = %name, removed, "neo4j index dropped");
        Ok(())
    }

    async fn index_inner(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        let registration = self.registration(&params.index_name).await?;
        let mut by_label: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (chunk, vector) in pair_embeddings(chunks, embeddings)? {
            if let Some(vector) = vector {
                check_dimension(&registration.name, registration.dimension, vector)?;
            }
            let label = params.label_for(chunk).to_string();
            let mut labelled = chunk.clone();
            labelled.node_label = label.clone();
            let props = chunk_properties(&labelled, &registration.name)?;
            by_label
                .entry(label)
                .or_default()
                .push(json!({ "id": chunk.id, "props": props, "embedding": vector }));
        }

        let batch_size = params.batch_size.unwrap_or(DEFAULT_WRITE_BATCH).max(1);
        for (label, rows) in by_label {
            let statement = format!(
                "UNWIND $rows AS row \
                 MERGE (n:{} {{id: row.id, {INDEX_PROPERTY}: $index}}) \
                 SET n = row.props \
                 SET n.{} = row.embedding",
                ident(&label),
                ident(&registration.embedding_property)
            );
            for batch in rows.chunks(batch_size) {
                let values = json!({ "rows": batch, "index": registration.name });
                self.executor.run(Statement::new(statement.clone()).with_params(values)).await?;
                debug!(
                    index = %registration.name,
                    %label,
                    count = batch.len(),
                    "neo4j chunks merged"
                );
            }
        }
        Ok(chunks.iter().map(|c| c.id.clone()).collect())
    }

    async fn delete_ids(&self, index_name: &str, ids: &[ChunkId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let statement =
            format!("MATCH (n) WHERE {} AND n.id IN $ids DETACH DELETE n", chunk_scope("n"));
        self.executor
            .run(Statement::new(statement).with_params(json!({ "index": index_name, "ids": ids })))
            .await?;
        Ok(())
    }

    /// Rows whose `props` is null (nodes outside this index) are skipped.
    fn rows_to_chunks(rows: &[Row], registration: &Registration) -> Result<Vec<(f32, Chunk)>> {
        rows.iter()
            .filter_map(|row| row.get("props").filter(|p| !p.is_null()).map(|props| (row, props)))
            .map(|(row, props)| {
                #[allow(clippy::cast_possible_truncation)]
                let score = row.get("score").and_then(Value::as_f64).unwrap_or(1.0) as f32;
                Ok((score, node_to_chunk(props, &registration.embedding_property)?))
            })
            .collect()
    }

    /// All chunks matching `criteria`, scored by the fulltext index when the
    /// query has terms and is conjunctive, lexically otherwise.
    async fn matching(
        &self,
        registration: &Registration,
        criteria: &Criteria<'_>,
    ) -> Result<Vec<(f32, Chunk)>> {
        let (clause, mut params) = criteria_clause(criteria, "node");
        params.insert("index".into(), json!(registration.name));
        let fulltext = !criteria.terms.is_empty() && criteria.logical == LogicalType::And;
        let statement = if fulltext {
            params.insert("ftIndex".into(), json!(registration.text_index));
            params.insert("query".into(), json!(criteria.terms.join(" OR ")));
            format!(
                "CALL db.index.fulltext.queryNodes($ftIndex, $query) YIELD node, score \
                 WHERE {}{} \
                 RETURN properties(node) AS props, score",
                chunk_scope("node"),
                and_clause(clause)
            )
        } else {
            format!(
                "MATCH (node) WHERE {}{} RETURN properties(node) AS props",
                chunk_scope("node"),
                and_clause(clause)
            )
        };
        let rows = self
            .executor
            .run(Statement::new(statement).with_params(Value::Object(params)))
            .await?;
        let mut hits = Self::rows_to_chunks(&rows, registration)?;
        hits.retain(|(_, chunk)| criteria.matches(chunk));
        if !fulltext {
            for (score, chunk) in &mut hits {
                *score = if criteria.terms.is_empty() {
                    1.0
                } else {
                    lexical_score(&chunk.text, &criteria.terms)
                };
            }
        }
        Ok(hits)
    }

    /// Nearest `k` chunks of this index. The native index may be shared with
    /// other logical indexes, so neighbours are fetched in a growing window
    /// until `k` of them belong here and pass `attrs`, or the native index
    /// has nothing more to return.
    async fn vector_hits(
        &self,
        registration: &Registration,
        request: &SearchRequest,
        embedding: &[f32],
    ) -> Result<Vec<ScoredChunk>> {
        check_dimension(&registration.name, registration.dimension, embedding)?;
        let criteria = Criteria::new(None, &request.attrs, request.logical_type);
        let statement = format!(
            "CALL db.index.vector.queryNodes($native, $k, $embedding) YIELD node, score \
             RETURN CASE WHEN {} THEN properties(node) END AS props, score",
            chunk_scope("node")
        );
        let mut fetch =
            (if criteria.is_empty() { request.k } else { request.k * REFINE_FACTOR }).max(1);
        loop {
            let params = json!({
                "native": registration.native_name,
                "k": fetch,
                "embedding": embedding,
                "index": registration.name,
            });
            let rows =
                self.executor.run(Statement::new(statement.clone()).with_params(params)).await?;
            let exhausted = rows.len() < fetch;
            let mut hits: Vec<ScoredChunk> = Self::rows_to_chunks(&rows, registration)?
                .into_iter()
                .filter(|(_, chunk)| criteria.matches(chunk))
                .map(|(score, chunk)| ScoredChunk::similarity(chunk, score))
                .collect();
            if hits.len() >= request.k || exhausted {
                sort_desc(&mut hits);
                hits.truncate(request.k);
                return Ok(hits);
            }
            debug!(index = %registration.name, fetch, kept = hits.len(), "widening vector query");
            fetch *= 2;
        }
    }

    async fn keyword_hits(
        &self,
        registration: &Registration,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredChunk>> {
        let criteria = Criteria::new(request.text(), &request.attrs, request.logical_type);
        let mut hits: Vec<ScoredChunk> = self
            .matching(registration, &criteria)
            .await?
            .into_iter()
            .map(|(score, chunk)| ScoredChunk::similarity(chunk, score))
            .collect();
        sort_desc(&mut hits);
        hits.truncate(request.k);
        Ok(hits)
    }

    async fn search_inner(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>> {
        let registration = self.registration(&request.index_name).await?;
        match request.effective_mode() {
            SearchMode::Vector => {
                self.vector_hits(&registration, request, request.require_embedding()?).await
            }
            SearchMode::Keyword => self.keyword_hits(&registration, request).await,
            SearchMode::Hybrid => {
                let vector =
                    self.vector_hits(&registration, request, request.require_embedding()?).await?;
                let keyword = self.keyword_hits(&registration, request).await?;
                Ok(fuse(vector, keyword, request.k))
            }
        }
    }

    async fn get_chunks_inner(&self, index_name: &str, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let registration = self.registration(index_name).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let statement = format!(
            "MATCH (node) WHERE {} AND node.id IN $ids RETURN properties(node) AS props",
            chunk_scope("node")
        );
        let rows = self
            .executor
            .run(Statement::new(statement).with_params(json!({ "index": index_name, "ids": ids })))
            .await?;
        let mut chunks: Vec<Chunk> =
            Self::rows_to_chunks(&rows, &registration)?.into_iter().map(|(_, c)| c).collect();
        chunks.sort_by_key(|c| ids.iter().position(|id| *id == c.id));
        Ok(chunks)
    }

    async fn delete_matching_inner(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()> {
        require_criteria(query_text, attrs)?;
        let registration = self.registration(&params.index_name).await?;
        let criteria = Criteria::new(query_text, attrs, LogicalType::And);
        let ids: Vec<ChunkId> =
            self.matching(&registration, &criteria).await?.into_iter().map(|(_, c)| c.id).collect();
        self.delete_ids(&registration.name, &ids).await?;
        info!(index = %registration.name, count = ids.len(), "neo4j chunks deleted by match");
        Ok(())
    }
}

#[async_trait]
impl IndexLifecycle for GraphStore {
    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        with_deadline("create_index", self.options.deadline(), self.create_inner(spec)).await
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        with_deadline("drop_index", self.options.deadline(), self.drop_inner(name)).await
    }

    async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo> {
        let fut = async { self.info(&self.registration(name).await?).await };
        let result = with_deadline("get_index", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_index", name, result)
    }

    async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>> {
        let fut = async {
            let mut out = Vec::new();
            for registration in self.registrations().await? {
                out.push(self.info(&registration).await?);
            }
            Ok::<_, Error>(out)
        };
        let result = with_deadline("get_indexes", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_indexes", "*", result)
    }

    async fn number_chunks(&self, name: &str) -> ReadOutcome<u64> {
        let fut = async { self.count(&self.registration(name).await?).await };
        let result = with_deadline("number_chunks", self.options.deadline(), fut).await;
        ReadOutcome::capture("number_chunks", name, result)
    }
}

#[async_trait]
impl ChunkWriter for GraphStore {
    async fn index_chunks(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        let fut = self.index_inner(chunks, embeddings, params);
        with_deadline("index_chunks", self.options.deadline(), fut).await
    }

    async fn delete_chunks(&self, ids: &[ChunkId], params: &DeleteParams) -> Result<()> {
        let fut = async {
            self.registration(&params.index_name).await?;
            self.delete_ids(&params.index_name, ids).await
        };
        with_deadline("delete_chunks", self.options.deadline(), fut).await
    }

    async fn delete_chunks_matching(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()> {
        let fut = self.delete_matching_inner(query_text, attrs, params);
        with_deadline("delete_chunks_matching", self.options.deadline(), fut).await
    }

    fn retry_policy(&self) -> RetryPolicy { self.options.retry }
}

#[async_trait]
impl QueryEngine for GraphStore {
    async fn search(&self, request: &SearchRequest) -> ReadOutcome<Vec<ScoredChunk>> {
        let result =
            with_deadline("search", self.options.deadline(), self.search_inner(request)).await;
        ReadOutcome::capture("search", &request.index_name, result)
    }

    async fn get_chunks(&self, index_name: &str, ids: &[ChunkId]) -> ReadOutcome<Vec<Chunk>> {
        let fut = self.get_chunks_inner(index_name, ids);
        let result = with_deadline("get_chunks", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_chunks", index_name, result)
    }
}

#[async_trait]
impl ChunkStore for GraphStore {
    fn provider(&self) -> BackendProvider { BackendProvider::Graph }

    async fn close(&self) -> Result<()> {
        self.executor.close().await?;
        info!("neo4j store closed");
        Ok(())
    }
}
