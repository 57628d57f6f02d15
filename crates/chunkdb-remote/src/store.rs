//! Remote search service store.
//!
//! Writes go through the [`BatchQueue`]; reads, deletes and index management
//! are direct REST calls. Deletes flush the index's queued writes first.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use chunkdb_core::config::RemoteSettings;
use chunkdb_core::filter::{require_criteria, Criteria};
use chunkdb_core::fusion::{fuse, sort_desc};
use chunkdb_core::retry::{with_deadline, CallOptions, RetryPolicy};
use chunkdb_core::schema::{project_schema, ProjectionOptions};
use chunkdb_core::similarity::check_dimension;
use chunkdb_core::types::{
    pair_embeddings, Attributes, BackendProvider, Chunk, ChunkId, DeleteParams, IndexHandle,
    IndexInfo, IndexSpec, LogicalType, ScoredChunk, SearchMode, SearchRequest, WriteParams,
    DEFAULT_NODE_LABEL,
};
use chunkdb_core::{
    ChunkStore, ChunkWriter, Error, IndexLifecycle, QueryEngine, ReadOutcome, Result,
};

use crate::client::{IndexDefinition, RemoteClient, SearchBody};
use crate::documents::{
    attribute_filter, delete_document, document_to_chunk, field_definitions, upload_document,
    SEPARATOR,
};
use crate::queue::{BatchQueue, BatchSettings, QueueKey};

const REFINE_FACTOR: usize = 4;
const SCAN_PAGE: usize = 1000;

pub struct RemoteStore {
    client: RemoteClient,
    queue: BatchQueue,
    batch_size: usize,
    definitions: RwLock<HashMap<String, IndexDefinition>>,
    options: CallOptions,
}

impl RemoteStore {
    pub fn connect(settings: &RemoteSettings, options: CallOptions) -> Result<Self> {
        let client = RemoteClient::new(settings, options.deadline())?;
        let batch = BatchSettings::from(settings);
        let queue = BatchQueue::new(client.clone(), batch, options.retry);
        info!(endpoint = %settings.endpoint, batch_size = batch.batch_size, "remote store ready");
        Ok(Self {
            client,
            queue,
            batch_size: batch.batch_size,
            definitions: RwLock::new(HashMap::new()),
            options,
        })
    }

    /// Write batching, exposed for flushing and inspection.
    pub fn queue(&self) -> &BatchQueue { &self.queue }

    /// Push queued writes for `index` to the service and wait for them.
    pub async fn flush(&self, index: &str) -> Result<()> { self.queue.flush(index).await }

    async fn definition(&self, name: &str) -> Result<IndexDefinition> {
        if let Some(found) = self.definitions.read().await.get(name) {
            return Ok(found.clone());
        }
        let definition = self.client.get_index(name).await?;
        self.definitions.write().await.insert(name.to_string(), definition.clone());
        Ok(definition)
    }

    async fn info(&self, definition: &IndexDefinition) -> Result<IndexInfo> {
        Ok(IndexInfo {
            name: definition.name.clone(),
            provider: BackendProvider::Remote,
            native_name: Some(definition.name.clone()),
            node_label: Some(label_of(definition).to_string()),
            embedding_dimension: definition.dimension(),
            similarity: Some(definition.similarity()),
            document_count: self.client.document_count(&definition.name).await?,
        })
    }

    async fn create_inner(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        spec.validate()?;
        match self.client.get_index(&spec.name).await {
            Ok(_) => return Err(Error::AlreadyExists(spec.name.clone())),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let options = ProjectionOptions {
            separator: SEPARATOR.to_string(),
            ..ProjectionOptions::for_label(&spec.node_label, &spec.embedding_property)
        };
        let projected = project_schema(&spec.schema, &options)?;
        let definition = IndexDefinition {
            name: spec.name.clone(),
            fields: field_definitions(
                &spec.node_label,
                &projected,
                spec.embedding_dimension,
                spec.similarity,
            ),
            node_label: Some(spec.node_label.clone()),
        };
        self.client.put_index(&definition).await?;
        info!(index = %spec.name, fields = definition.fields.len(), "remote index created");
        self.definitions.write().await.insert(spec.name.clone(), definition);
        Ok(IndexHandle {
            name: spec.name.clone(),
            provider: BackendProvider::Remote,
            native_name: spec.name.clone(),
        })
    }

    async fn drop_inner(&self, name: &str) -> Result<()> {
        self.queue.flush(name).await?;
        self.definitions.write().await.remove(name);
        self.client.delete_index(name).await?;
        info!(index = %name, "remote index dropped");
        Ok(())
    }

    async fn index_inner(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        let definition = self.definition(&params.index_name).await?;
        let pairs = pair_embeddings(chunks, embeddings)?;
        if let Some(dimension) = definition.dimension() {
            for vector in pairs.iter().filter_map(|(_, v)| *v) {
                check_dimension(&definition.name, dimension, vector)?;
            }
        }
        for (chunk, vector) in pairs {
            let label = params.label_for(chunk);
            let key = QueueKey { index: definition.name.clone(), node_label: label.to_string() };
            self.queue.enqueue(&key, upload_document(chunk, label, vector)?).await?;
        }
        Ok(chunks.iter().map(|c| c.id.clone()).collect())
    }

    async fn delete_ids(&self, index: &str, ids: &[ChunkId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.queue.flush(index).await?;
        let docs: Vec<Value> = ids.iter().map(|id| delete_document(id)).collect();
        for batch in docs.chunks(self.batch_size) {
            self.client.index_documents(index, batch).await?;
        }
        Ok(())
    }

    /// Run `body` once when `limit` is set, otherwise page through all results.
    async fn fetch(
        &self,
        index: &str,
        mut body: SearchBody,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        if let Some(top) = limit {
            body.top = top;
            return self.client.search(index, &body).await;
        }
        body.top = SCAN_PAGE;
        let mut out = Vec::new();
        loop {
            body.skip = Some(out.len());
            let page = self.client.search(index, &body).await?;
            let done = page.len() < SCAN_PAGE;
            out.extend(page);
            if done {
                return Ok(out);
            }
        }
    }

    /// Chunks matching `criteria`, refined locally. Disjunctions of text and
    /// attributes run as two requests since the service ANDs `search` and `filter`.
    /// The flag is true when no request hit `limit`.
    async fn matching(
        &self,
        definition: &IndexDefinition,
        criteria: &Criteria<'_>,
        limit: Option<usize>,
    ) -> Result<(Vec<(f32, Chunk)>, bool)> {
        let search = (!criteria.terms.is_empty()).then(|| criteria.terms.join(" "));
        let filter = attribute_filter(criteria, label_of(definition));
        let split = criteria.logical == LogicalType::Or && search.is_some() && filter.is_some();
        let bodies = if split {
            vec![
                SearchBody { search, ..SearchBody::default() },
                SearchBody { filter, ..SearchBody::default() },
            ]
        } else {
            vec![SearchBody { search, filter, ..SearchBody::default() }]
        };

        let mut exhausted = true;
        let mut by_id: HashMap<String, (f32, Chunk)> = HashMap::new();
        for body in bodies {
            let docs = self.fetch(&definition.name, body, limit).await?;
            if limit.is_some_and(|top| docs.len() >= top) {
                exhausted = false;
            }
            for doc in docs {
                let (score, chunk) = document_to_chunk(&doc)?;
                if !criteria.matches(&chunk) {
                    continue;
                }
                let score = score.unwrap_or(1.0);
                if by_id.get(&chunk.id).map_or(true, |(best, _)| score > *best) {
                    by_id.insert(chunk.id.clone(), (score, chunk));
                }
            }
        }
        Ok((by_id.into_values().collect(), exhausted))
    }

    /// Top `k` keyword hits. The fetch size doubles until `k` survive local
    /// refinement or the service runs out of results.
    async fn keyword_hits(
        &self,
        definition: &IndexDefinition,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredChunk>> {
        let criteria = Criteria::new(request.text(), &request.attrs, request.logical_type);
        let mut top = (request.k * REFINE_FACTOR).max(1);
        loop {
            let (found, exhausted) = self.matching(definition, &criteria, Some(top)).await?;
            if found.len() >= request.k || exhausted {
                let mut hits: Vec<ScoredChunk> = found
                    .into_iter()
                    .map(|(score, chunk)| ScoredChunk::similarity(chunk, score))
                    .collect();
                sort_desc(&mut hits);
                hits.truncate(request.k);
                return Ok(hits);
            }
            debug!(index = %definition.name, top, kept = found.len(), "widening keyword fetch");
            top *= 2;
        }
    }

    /// Top `k` nearest chunks passing `attrs`, widening like [`Self::keyword_hits`].
    async fn vector_hits(
        &self,
        definition: &IndexDefinition,
        request: &SearchRequest,
        embedding: &[f32],
    ) -> Result<Vec<ScoredChunk>> {
        if let Some(dimension) = definition.dimension() {
            check_dimension(&definition.name, dimension, embedding)?;
        }
        let criteria = Criteria::new(None, &request.attrs, request.logical_type);
        let filter = attribute_filter(&criteria, label_of(definition));
        let mut top = (request.k * REFINE_FACTOR).max(1);
        loop {
            let body = SearchBody {
                filter: filter.clone(),
                top,
                vector: Some(embedding.to_vec()),
                ..SearchBody::default()
            };
            let docs = self.client.search(&definition.name, &body).await?;
            let exhausted = docs.len() < top;
            let mut hits = Vec::new();
            for doc in docs {
                let (score, chunk) = document_to_chunk(&doc)?;
                if criteria.matches(&chunk) {
                    hits.push(ScoredChunk::similarity(chunk, score.unwrap_or(0.0)));
                }
            }
            if hits.len() >= request.k || exhausted {
                sort_desc(&mut hits);
                hits.truncate(request.k);
                return Ok(hits);
            }
            debug!(index = %definition.name, top, kept = hits.len(), "widening vector fetch");
            top *= 2;
        }
    }

    async fn search_inner(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>> {
        let definition = self.definition(&request.index_name).await?;
        match request.effective_mode() {
            SearchMode::Vector => {
                self.vector_hits(&definition, request, request.require_embedding()?).await
            }
            SearchMode::Keyword => self.keyword_hits(&definition, request).await,
            SearchMode::Hybrid => {
                let vector =
                    self.vector_hits(&definition, request, request.require_embedding()?).await?;
                let keyword = self.keyword_hits(&definition, request).await?;
                Ok(fuse(vector, keyword, request.k))
            }
        }
    }

    async fn get_chunks_inner(&self, index: &str, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let definition = self.definition(index).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut chunks = self
            .client
            .lookup(&definition.name, ids)
            .await?
            .iter()
            .map(|doc| document_to_chunk(doc).map(|(_, chunk)| chunk))
            .collect::<Result<Vec<_>>>()?;
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
        let definition = self.definition(&params.index_name).await?;
        self.queue.flush(&definition.name).await?;
        let criteria = Criteria::new(query_text, attrs, LogicalType::And);
        let (matched, _) = self.matching(&definition, &criteria, None).await?;
        let ids: Vec<ChunkId> = matched.into_iter().map(|(_, c)| c.id).collect();
        self.delete_ids(&definition.name, &ids).await?;
        info!(index = %definition.name, count = ids.len(), "remote chunks deleted by match");
        Ok(())
    }
}

fn label_of(definition: &IndexDefinition) -> &str {
    definition.node_label.as_deref().unwrap_or(DEFAULT_NODE_LABEL)
}

#[async_trait]
impl IndexLifecycle for RemoteStore {
    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        with_deadline("create_index", self.options.deadline(), self.create_inner(spec)).await
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        with_deadline("drop_index", self.options.deadline(), self.drop_inner(name)).await
    }

    async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo> {
        let fut = async { self.info(&self.definition(name).await?).await };
        let result = with_deadline("get_index", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_index", name, result)
    }

    async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>> {
        let fut = async {
            let mut out = Vec::new();
            for definition in self.client.list_indexes().await? {
                out.push(self.info(&definition).await?);
            }
            Ok::<_, Error>(out)
        };
        let result = with_deadline("get_indexes", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_indexes", "*", result)
    }

    async fn number_chunks(&self, name: &str) -> ReadOutcome<u64> {
        let fut = self.client.document_count(name);
        let result = with_deadline("number_chunks", self.options.deadline(), fut).await;
        ReadOutcome::capture("number_chunks", name, result)
    }
}

#[async_trait]
impl ChunkWriter for RemoteStore {
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
            self.definition(&params.index_name).await?;
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
impl QueryEngine for RemoteStore {
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
impl ChunkStore for RemoteStore {
    fn provider(&self) -> BackendProvider { BackendProvider::Remote }

    async fn close(&self) -> Result<()> {
        self.queue.close().await?;
        info!("remote store closed");
        Ok(())
    }
}
