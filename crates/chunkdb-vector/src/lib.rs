#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! LanceDB-backed chunk store.
//!
//! One Arrow table per index: `id`, the chunk JSON in `_source`, a
//! fixed-size `vector` column and one nullable column per projected filter
//! field. Index specs live in a small meta table next to the chunk tables.

pub mod schema;
pub mod search;
pub mod table;
pub mod writer;

use async_trait::async_trait;
use std::collections::HashMap;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use tracing::{debug, info};

use chunkdb_core::config::{expand_path, LanceSettings};
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

use crate::schema::{build_chunk_schema, filter_columns, project};
use crate::search::{decode_batches, id_predicate, pushdown_predicate, Hit};
use crate::table::{
    delete_meta, ensure_table, get_meta, lance_error, list_meta, open_db, set_meta, table_exists,
    META_TABLE,
};
use crate::writer::{rows_to_record_batch, upsert, Row};

const DEFAULT_BATCH_SIZE: usize = 1000;
/// Vector candidates fetched per requested hit when results are refined in Rust.
const REFINE_FACTOR: usize = 4;

fn distance_type(metric: SimilarityMetric) -> DistanceType {
    match metric {
        SimilarityMetric::Cosine => DistanceType::Cosine,
        SimilarityMetric::Dot => DistanceType::Dot,
        SimilarityMetric::Euclidean => DistanceType::L2,
    }
}

pub struct LanceStore {
    db: Connection,
    options: CallOptions,
}

impl LanceStore {
    pub async fn connect(settings: &LanceSettings, options: CallOptions) -> Result<Self> {
        let uri = if settings.uri.contains("://") {
            settings.uri.clone()
        } else {
            expand_path(&settings.uri).to_string_lossy().to_string()
        };
        let db = open_db(&uri).await?;
        info!(%uri, "lancedb connected");
        Ok(Self::from_connection(db, options))
    }

    pub fn from_connection(db: Connection, options: CallOptions) -> Self { Self { db, options } }

    async fn spec(&self, name: &str) -> Result<IndexSpec> {
        let raw = get_meta(&self.db, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("index '{name}'")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn open(&self, name: &str) -> Result<(IndexSpec, Table)> {
        let spec = self.spec(name).await?;
        let table = self.db.open_table(name).execute().await.map_err(lance_error)?;
        Ok((spec, table))
    }

    async fn info(&self, spec: &IndexSpec) -> Result<IndexInfo> {
        let table = self.db.open_table(&spec.name).execute().await.map_err(lance_error)?;
        let count = table.count_rows(None).await.map_err(lance_error)?;
        Ok(IndexInfo {
            name: spec.name.clone(),
            provider: BackendProvider::Vector,
            native_name: Some(spec.name.clone()),
            node_label: Some(spec.node_label.clone()),
            embedding_dimension: Some(spec.embedding_dimension),
            similarity: Some(spec.similarity),
            document_count: count as u64,
        })
    }

    /// Every chunk matching `criteria`, pushed down where possible.
    async fn matching(
        &self,
        spec: &IndexSpec,
        table: &Table,
        criteria: &Criteria<'_>,
    ) -> Result<Vec<Chunk>> {
        let columns = filter_columns(&project(spec)?);
        let mut query = table.query();
        if let Some(predicate) = pushdown_predicate(criteria, &columns) {
            debug!(index = %spec.name, %predicate, "lancedb pushdown");
            query = query.only_if(predicate);
        }
        let batches: Vec<_> = query
            .execute()
            .await
            .map_err(lance_error)?
            .try_collect()
            .await
            .map_err(lance_error)?;
        let hits = decode_batches(&batches)?;
        Ok(hits.into_iter().map(|h| h.chunk).filter(|c| criteria.matches(c)).collect())
    }

    /// Nearest `k` chunks passing `attrs`. When part of the filter is only
    /// checked in Rust the candidate limit doubles until `k` survive or the
    /// table has no more rows to give.
    async fn vector_hits(
        &self,
        spec: &IndexSpec,
        table: &Table,
        request: &SearchRequest,
        embedding: &[f32],
    ) -> Result<Vec<ScoredChunk>> {
        check_dimension(&spec.name, spec.embedding_dimension, embedding)?;
        let criteria = Criteria::new(None, &request.attrs, request.logical_type);
        let columns = filter_columns(&project(spec)?);
        let predicate = pushdown_predicate(&criteria, &columns);
        let mut limit = if criteria.is_empty() { request.k } else { request.k * REFINE_FACTOR };
        limit = limit.max(1);
        loop {
            let mut query = table
                .vector_search(embedding.to_vec())
                .map_err(lance_error)?
                .distance_type(distance_type(spec.similarity))
                .limit(limit);
            if let Some(predicate) = &predicate {
                query = query.only_if(predicate.clone());
            }
            let batches: Vec<_> = query
                .execute()
                .await
                .map_err(lance_error)?
                .try_collect()
                .await
                .map_err(lance_error)?;
            let candidates = decode_batches(&batches)?;
            let exhausted = candidates.len() < limit;
            let mut hits: Vec<ScoredChunk> = candidates
                .into_iter()
                .filter(|h| criteria.matches(&h.chunk))
                .map(|Hit { chunk, distance }| {
                    ScoredChunk::distance(chunk, distance.unwrap_or(f32::MAX))
                })
                .collect();
            if hits.len() >= request.k || exhausted {
                hits.sort_by(|a, b| {
                    a.score.total_cmp(&b.score).then_with(|| a.chunk.id.cmp(&b.chunk.id))
                });
                hits.truncate(request.k);
                return Ok(hits);
            }
            debug!(index = %spec.name, limit, kept = hits.len(), "widening vector search");
            limit *= 2;
        }
    }

    async fn keyword_hits(
        &self,
        spec: &IndexSpec,
        table: &Table,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredChunk>> {
        let criteria = Criteria::new(request.text(), &request.attrs, request.logical_type);
        let chunks = self.matching(spec, table, &criteria).await?;
        let mut hits: Vec<ScoredChunk> = chunks
            .into_iter()
            .map(|chunk| {
                let score = if criteria.terms.is_empty() {
                    1.0
                } else {
                    lexical_score(&chunk.text, &criteria.terms)
                };
                ScoredChunk::similarity(chunk, score)
            })
            .collect();
        sort_desc(&mut hits);
        hits.truncate(request.k);
        Ok(hits)
    }

    async fn search_inner(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>> {
        let (spec, table) = self.open(&request.index_name).await?;
        match request.effective_mode() {
            SearchMode::Vector => {
                self.vector_hits(&spec, &table, request, request.require_embedding()?).await
            }
            SearchMode::Keyword => self.keyword_hits(&spec, &table, request).await,
            SearchMode::Hybrid => {
                let vector = self
                    .vector_hits(&spec, &table, request, request.require_embedding()?)
                    .await?
                    .into_iter()
                    .map(|h| h.into_similarity(spec.similarity))
                    .collect();
                let keyword = self.keyword_hits(&spec, &table, request).await?;
                Ok(fuse(vector, keyword, request.k))
            }
        }
    }

    async fn get_chunks_inner(&self, index_name: &str, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let (_, table) = self.open(index_name).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let batches: Vec<_> = table
            .query()
            .only_if(id_predicate(ids))
            .execute()
            .await
            .map_err(lance_error)?
            .try_collect()
            .await
            .map_err(lance_error)?;
        let mut found: HashMap<ChunkId, Chunk> = decode_batches(&batches)?
            .into_iter()
            .map(|h| (h.chunk.id.clone(), h.chunk))
            .collect();
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn create_inner(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        spec.validate()?;
        if spec.name == META_TABLE {
            return Err(Error::InvalidRequest(format!("'{META_TABLE}' is reserved")));
        }
        if get_meta(&self.db, &spec.name).await?.is_some()
            || table_exists(&self.db, &spec.name).await?
        {
            return Err(Error::AlreadyExists(spec.name.clone()));
        }
        let columns = filter_columns(&project(spec)?);
        let schema = build_chunk_schema(spec.embedding_dimension, &columns)?;
        ensure_table(&self.db, &spec.name, schema).await?;
        set_meta(&self.db, &spec.name, &serde_json::to_string(spec)?).await?;
        info!(
            index = %spec.name,
            dim = spec.embedding_dimension,
            metric = %spec.similarity,
            columns = columns.len(),
            "lancedb index created"
        );
        Ok(IndexHandle {
            name: spec.name.clone(),
            provider: BackendProvider::Vector,
            native_name: spec.name.clone(),
        })
    }

    async fn drop_inner(&self, name: &str) -> Result<()> {
        let known = get_meta(&self.db, name).await?.is_some();
        let exists = table_exists(&self.db, name).await?;
        if !known && !exists {
            return Err(Error::NotFound(format!("index '{name}'")));
        }
        if exists {
            self.db.drop_table(name, &[]).await.map_err(lance_error)?;
        }
        delete_meta(&self.db, name).await?;
        info!(index = %name, "lancedb index dropped");
        Ok(())
    }

    async fn index_inner(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        let (spec, table) = self.open(&params.index_name).await?;
        let pairs = pair_embeddings(chunks, embeddings)?;
        for (_, vector) in &pairs {
            if let Some(vector) = vector {
                check_dimension(&spec.name, spec.embedding_dimension, vector)?;
            }
        }
        let columns = filter_columns(&project(&spec)?);
        let schema = build_chunk_schema(spec.embedding_dimension, &columns)?;
        let dim = i32::try_from(spec.embedding_dimension)
            .map_err(|_| Error::InvalidRequest("embedding dimension too large".into()))?;
        let batch_size = params.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);

        let mut ids = Vec::with_capacity(chunks.len());
        for group in pairs.chunks(batch_size) {
            let rows: Vec<Row<'_>> = group
                .iter()
                .map(|(chunk, vector)| {
                    let mut chunk = (*chunk).clone();
                    chunk.node_label = params.label_for(&chunk).to_string();
                    Row { chunk, vector: *vector }
                })
                .collect();
            let batch = rows_to_record_batch(schema.clone(), &columns, dim, &rows)?;
            upsert(&table, batch).await?;
            ids.extend(rows.into_iter().map(|r| r.chunk.id));
            debug!(index = %spec.name, written = ids.len(), "lancedb batch upserted");
        }
        Ok(ids)
    }

    async fn delete_inner(&self, ids: &[ChunkId], params: &DeleteParams) -> Result<()> {
        let (_, table) = self.open(&params.index_name).await?;
        if ids.is_empty() {
            return Ok(());
        }
        table.delete(&id_predicate(ids)).await.map_err(lance_error)?;
        debug!(index = %params.index_name, count = ids.len(), "lancedb chunks deleted");
        Ok(())
    }

    async fn delete_matching_inner(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()> {
        require_criteria(query_text, attrs)?;
        let (spec, table) = self.open(&params.index_name).await?;
        let criteria = Criteria::new(query_text, attrs, LogicalType::And);
        let ids: Vec<ChunkId> =
            self.matching(&spec, &table, &criteria).await?.into_iter().map(|c| c.id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        table.delete(&id_predicate(&ids)).await.map_err(lance_error)?;
        info!(index = %spec.name, count = ids.len(), "lancedb chunks deleted by match");
        Ok(())
    }
}

#[async_trait]
impl IndexLifecycle for LanceStore {
    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        with_deadline("create_index", self.options.deadline(), self.create_inner(spec)).await
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        with_deadline("drop_index", self.options.deadline(), self.drop_inner(name)).await
    }

    async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo> {
        let fut = async { self.info(&self.spec(name).await?).await };
        let result = with_deadline("get_index", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_index", name, result)
    }

    async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>> {
        let fut = async {
            let mut out = Vec::new();
            for (_, raw) in list_meta(&self.db).await? {
                let spec: IndexSpec = serde_json::from_str(&raw)?;
                out.push(self.info(&spec).await?);
            }
            Ok::<_, Error>(out)
        };
        let result = with_deadline("get_indexes", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_indexes", "*", result)
    }

    async fn number_chunks(&self, name: &str) -> ReadOutcome<u64> {
        let fut = async {
            Ok::<_, Error>(self.info(&self.spec(name).await?).await?.document_count)
        };
        let result = with_deadline("number_chunks", self.options.deadline(), fut).await;
        ReadOutcome::capture("number_chunks", name, result)
    }
}

#[async_trait]
impl ChunkWriter for LanceStore {
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
        let fut = self.delete_inner(ids, params);
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
impl QueryEngine for LanceStore {
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
impl ChunkStore for LanceStore {
    fn provider(&self) -> BackendProvider { BackendProvider::Vector }

    async fn close(&self) -> Result<()> {
        info!("lancedb store closed");
        Ok(())
    }
}
