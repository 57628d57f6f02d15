use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::outcome::ReadOutcome;
use crate::retry::RetryPolicy;
use crate::types::{
    Attributes, BackendProvider, Chunk, ChunkId, DeleteParams, IndexHandle, IndexInfo, IndexSpec,
    ScoredChunk, SearchRequest, WriteParams,
};

/// Text to fixed-length vectors. Real model clients live outside this crate.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Create, drop and describe indexes.
///
/// `create_index`/`drop_index` are strict and propagate failures; the
/// describing reads are lenient and never error.
#[async_trait]
pub trait IndexLifecycle: Send + Sync {
    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexHandle>;
    async fn drop_index(&self, name: &str) -> Result<()>;
    async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo>;
    async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>>;
    async fn number_chunks(&self, name: &str) -> ReadOutcome<u64>;
}

#[async_trait]
pub trait ChunkWriter: Send + Sync {
    /// Upsert `chunks`; explicit `embeddings` override the chunks' own.
    async fn index_chunks(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>>;

    /// Removing ids that do not exist is a successful no-op.
    async fn delete_chunks(&self, ids: &[ChunkId], params: &DeleteParams) -> Result<()>;

    /// Delete everything matching the text and/or attributes. At least one of
    /// the two must be non-empty.
    async fn delete_chunks_matching(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()>;

    fn retry_policy(&self) -> RetryPolicy { RetryPolicy::default() }

    /// Single-chunk upsert, retried on transient failures.
    async fn index_chunk(
        &self,
        chunk: &Chunk,
        embedding: Option<&[f32]>,
        params: &WriteParams,
    ) -> Result<ChunkId> {
        let owned: Option<Vec<Vec<f32>>> = embedding.map(|e| vec![e.to_vec()]);
        let embeddings = owned.as_deref();
        let chunks = std::slice::from_ref(chunk);
        let this = self;
        let ids = self
            .retry_policy()
            .run("index_chunk", move || this.index_chunks(chunks, embeddings, params))
            .await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Operation(format!("no id returned for chunk '{}'", chunk.id)))
    }

    /// Single-id delete, retried on transient failures.
    async fn delete_chunk(&self, id: &str, params: &DeleteParams) -> Result<()> {
        let ids = vec![id.to_string()];
        let ids = ids.as_slice();
        let this = self;
        self.retry_policy().run("delete_chunk", move || this.delete_chunks(ids, params)).await
    }
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> ReadOutcome<Vec<ScoredChunk>>;
    async fn get_chunks(&self, index_name: &str, ids: &[ChunkId]) -> ReadOutcome<Vec<Chunk>>;
}

/// One backend: lifecycle, writer and query engine over a shared connection.
#[async_trait]
pub trait ChunkStore: IndexLifecycle + ChunkWriter + QueryEngine {
    fn provider(&self) -> BackendProvider;

    /// Release the backend connection. Further calls may fail.
    async fn close(&self) -> Result<()> { Ok(()) }
}
