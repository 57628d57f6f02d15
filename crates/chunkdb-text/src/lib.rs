#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! chunkdb-text
//!
//! Tantivy-backed hybrid store: BM25 keyword search over the chunk text,
//! raw term fields for attribute filters, and vectors kept in the stored
//! source and scored in-process. See `index` for the on-disk layout.

pub mod index;
pub mod search;
pub mod tantivy_utils;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use chunkdb_core::config::{expand_path, TantivySettings};
use chunkdb_core::filter::{require_criteria, Criteria};
use chunkdb_core::fusion::{fuse, sort_desc};
use chunkdb_core::retry::{with_deadline, CallOptions, RetryPolicy};
use chunkdb_core::similarity::{check_dimension, similarity};
use chunkdb_core::types::{
    pair_embeddings, Attributes, BackendProvider, Chunk, ChunkId, DeleteParams, IndexHandle,
    IndexInfo, IndexSpec, LogicalType, ScoredChunk, SearchMode, SearchRequest, WriteParams,
};
use chunkdb_core::{
    ChunkStore, ChunkWriter, Error, IndexLifecycle, QueryEngine, ReadOutcome, Result,
};

pub use index::OpenIndex;

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Operation(format!("tantivy task failed: {e}")))?
}

fn info_for(index: &OpenIndex) -> IndexInfo {
    IndexInfo {
        name: index.spec.name.clone(),
        provider: BackendProvider::Text,
        native_name: Some(index.spec.name.clone()),
        node_label: Some(index.spec.node_label.clone()),
        embedding_dimension: Some(index.spec.embedding_dimension),
        similarity: Some(index.spec.similarity),
        document_count: index.count(),
    }
}

fn vector_hits(
    index: &OpenIndex,
    request: &SearchRequest,
    embedding: &[f32],
) -> Result<Vec<ScoredChunk>> {
    check_dimension(&index.spec.name, index.spec.embedding_dimension, embedding)?;
    let criteria = Criteria::new(None, &request.attrs, request.logical_type);
    let mut hits: Vec<ScoredChunk> = index
        .matching(&criteria)?
        .into_iter()
        .filter_map(|(_, chunk)| {
            let score = similarity(index.spec.similarity, embedding, chunk.embedding.as_deref()?);
            Some(ScoredChunk::similarity(chunk, score))
        })
        .collect();
    sort_desc(&mut hits);
    hits.truncate(request.k);
    Ok(hits)
}

fn keyword_hits(index: &OpenIndex, request: &SearchRequest) -> Result<Vec<ScoredChunk>> {
    let criteria = Criteria::new(request.text(), &request.attrs, request.logical_type);
    let mut hits: Vec<ScoredChunk> = index
        .matching(&criteria)?
        .into_iter()
        .map(|(score, chunk)| ScoredChunk::similarity(chunk, score))
        .collect();
    sort_desc(&mut hits);
    hits.truncate(request.k);
    Ok(hits)
}

fn search_index(index: &OpenIndex, request: &SearchRequest) -> Result<Vec<ScoredChunk>> {
    match request.effective_mode() {
        SearchMode::Vector => vector_hits(index, request, request.require_embedding()?),
        SearchMode::Keyword => keyword_hits(index, request),
        SearchMode::Hybrid => {
            let vector = vector_hits(index, request, request.require_embedding()?)?;
            let keyword = keyword_hits(index, request)?;
            Ok(fuse(vector, keyword, request.k))
        }
    }
}

pub struct TantivyStore {
    root: PathBuf,
    heap_bytes: usize,
    options: CallOptions,
    open: Mutex<HashMap<String, Arc<OpenIndex>>>,
}

impl TantivyStore {
    pub fn new(settings: &TantivySettings, options: CallOptions) -> Result<Self> {
        let root = expand_path(&settings.root_dir);
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::InvalidConfig(format!("tantivy root {}: {e}", root.display()))
        })?;
        info!(root = %root.display(), "tantivy store opened");
        Ok(Self {
            root,
            heap_bytes: settings.writer_heap_bytes,
            options,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn dir(&self, name: &str) -> PathBuf { self.root.join(name) }

    /// Open index handle, opening it from disk on first use.
    async fn handle(&self, name: &str) -> Result<Arc<OpenIndex>> {
        let mut open = self.open.lock().await;
        if let Some(index) = open.get(name) {
            return Ok(index.clone());
        }
        let dir = self.dir(name);
        if !index::spec_path(&dir).exists() {
            return Err(Error::NotFound(format!("index '{name}'")));
        }
        let heap = self.heap_bytes;
        let index = Arc::new(blocking(move || OpenIndex::open(&dir, heap)).await?);
        open.insert(name.to_string(), index.clone());
        Ok(index)
    }

    async fn create_inner(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        spec.validate()?;
        let mut open = self.open.lock().await;
        let dir = self.dir(&spec.name);
        if open.contains_key(&spec.name) || dir.exists() {
            return Err(Error::AlreadyExists(spec.name.clone()));
        }
        let (heap, owned) = (self.heap_bytes, spec.clone());
        let index = blocking(move || OpenIndex::create(&dir, owned, heap)).await?;
        open.insert(spec.name.clone(), Arc::new(index));
        info!(index = %spec.name, dim = spec.embedding_dimension, "tantivy index created");
        Ok(IndexHandle {
            name: spec.name.clone(),
            provider: BackendProvider::Text,
            native_name: spec.name.clone(),
        })
    }

    async fn drop_inner(&self, name: &str) -> Result<()> {
        let mut open = self.open.lock().await;
        open.remove(name);
        let dir = self.dir(name);
        if !dir.exists() {
            return Err(Error::NotFound(format!("index '{name}'")));
        }
        blocking(move || {
            std::fs::remove_dir_all(&dir).map_err(|e| Error::backend("tantivy", e.to_string()))
        })
        .await?;
        info!(index = %name, "tantivy index dropped");
        Ok(())
    }

    async fn list_inner(&self) -> Result<Vec<IndexInfo>> {
        let mut names = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| Error::backend("tantivy", e.to_string()))?;
        for entry in entries.flatten() {
            if index::spec_path(&entry.path()).exists() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(info_for(&*self.handle(&name).await?));
        }
        Ok(out)
    }

    async fn index_inner(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        let index = self.handle(&params.index_name).await?;
        let mut rows = Vec::with_capacity(chunks.len());
        for (chunk, vector) in pair_embeddings(chunks, embeddings)? {
            if let Some(vector) = vector {
                check_dimension(&index.spec.name, index.spec.embedding_dimension, vector)?;
            }
            let mut row = chunk.clone();
            row.node_label = params.label_for(chunk).to_string();
            row.embedding = vector.map(<[f32]>::to_vec);
            rows.push(row);
        }
        let ids: Vec<ChunkId> = rows.iter().map(|c| c.id.clone()).collect();
        let batch_size = params.batch_size.unwrap_or(rows.len()).max(1);
        for group in rows.chunks(batch_size) {
            let (index, group) = (index.clone(), group.to_vec());
            blocking(move || index.upsert(&group)).await?;
        }
        Ok(ids)
    }

    async fn delete_inner(&self, ids: &[ChunkId], params: &DeleteParams) -> Result<()> {
        let index = self.handle(&params.index_name).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        blocking(move || index.delete_ids(&ids)).await
    }

    async fn delete_matching_inner(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()> {
        require_criteria(query_text, attrs)?;
        let index = self.handle(&params.index_name).await?;
        let (text, attrs) = (query_text.map(str::to_string), attrs.clone());
        let removed = blocking(move || {
            let criteria = Criteria::new(text.as_deref(), &attrs, LogicalType::And);
            let ids: Vec<ChunkId> =
                index.matching(&criteria)?.into_iter().map(|(_, c)| c.id).collect();
            if !ids.is_empty() {
                index.delete_ids(&ids)?;
            }
            Ok(ids.len())
        })
        .await?;
        info!(index = %params.index_name, removed, "tantivy chunks deleted by match");
        Ok(())
    }

    async fn search_inner(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>> {
        let index = self.handle(&request.index_name).await?;
        let request = request.clone();
        blocking(move || search_index(&index, &request)).await
    }

    async fn get_chunks_inner(&self, index_name: &str, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let index = self.handle(index_name).await?;
        let ids = ids.to_vec();
        blocking(move || index.get(&ids)).await
    }
}

#[async_trait]
impl IndexLifecycle for TantivyStore {
    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        with_deadline("create_index", self.options.deadline(), self.create_inner(spec)).await
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        with_deadline("drop_index", self.options.deadline(), self.drop_inner(name)).await
    }

    async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo> {
        let fut = async { Ok::<_, Error>(info_for(&*self.handle(name).await?)) };
        let result = with_deadline("get_index", self.options.deadline(), fut).await;
        ReadOutcome::capture("get_index", name, result)
    }

    async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>> {
        let result = with_deadline("get_indexes", self.options.deadline(), self.list_inner()).await;
        ReadOutcome::capture("get_indexes", "*", result)
    }

    async fn number_chunks(&self, name: &str) -> ReadOutcome<u64> {
        let fut = async { Ok::<_, Error>(self.handle(name).await?.count()) };
        let result = with_deadline("number_chunks", self.options.deadline(), fut).await;
        ReadOutcome::capture("number_chunks", name, result)
    }
}

#[async_trait]
impl ChunkWriter for TantivyStore {
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
impl QueryEngine for TantivyStore {
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
impl ChunkStore for TantivyStore {
    fn provider(&self) -> BackendProvider { BackendProvider::Text }

    async fn close(&self) -> Result<()> {
        let mut open = self.open.lock().await;
        let count = open.len();
        open.clear();
        info!(count, "tantivy writers released");
        Ok(())
    }
}
