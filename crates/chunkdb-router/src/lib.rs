#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! Routes index names to the backend that owns them.
//!
//! Every index name is claimed by at most one backend. Routes are learned at
//! `create_index` and, for indexes created by an earlier process, by asking
//! each backend's `get_index` on first use.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use chunkdb_core::config::Settings;
use chunkdb_core::retry::RetryPolicy;
use chunkdb_core::types::{
    Attributes, BackendProvider, Chunk, ChunkId, DeleteParams, IndexHandle, IndexInfo, IndexSpec,
    ScoredChunk, SearchRequest, WriteParams,
};
use chunkdb_core::{ChunkStore, ChunkWriter, Error, QueryEngine, ReadOutcome, Result};
use chunkdb_graph::GraphStore;
use chunkdb_remote::RemoteStore;
use chunkdb_text::TantivyStore;
use chunkdb_vector::LanceStore;

pub struct IndexRouter {
    backends: BTreeMap<BackendProvider, Arc<dyn ChunkStore>>,
    routes: RwLock<HashMap<String, BackendProvider>>,
    retry: RetryPolicy,
}

impl Default for IndexRouter {
    fn default() -> Self { Self::new() }
}

impl IndexRouter {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            routes: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    /// Register a backend under its own provider, replacing any earlier one.
    #[must_use]
    pub fn with_backend(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.backends.insert(store.provider(), store);
        self
    }

    /// Open every backend the settings describe. LanceDB and Tantivy are
    /// always local; Neo4j and the remote service only when configured.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let call = settings.call;
        let mut router = Self::new()
            .with_backend(Arc::new(LanceStore::connect(&settings.lancedb, call).await?))
            .with_backend(Arc::new(TantivyStore::new(&settings.tantivy, call)?));
        if let Some(neo4j) = &settings.neo4j {
            router = router.with_backend(Arc::new(GraphStore::connect(neo4j, call)?));
        }
        if let Some(remote) = &settings.remote {
            router = router.with_backend(Arc::new(RemoteStore::connect(remote, call)?));
        }
        router.retry = call.retry;
        info!(backends = ?router.providers(), "index router ready");
        Ok(router)
    }

    pub fn providers(&self) -> Vec<BackendProvider> { self.backends.keys().copied().collect() }

    pub fn backend(&self, provider: BackendProvider) -> Result<&Arc<dyn ChunkStore>> {
        self.backends
            .get(&provider)
            .ok_or_else(|| Error::InvalidConfig(format!("no {provider} backend is configured")))
    }

    /// Every backend that currently reports an index with this name.
    async fn claimants(&self, name: &str) -> Vec<BackendProvider> {
        let mut found = Vec::new();
        for (provider, store) in &self.backends {
            match store.get_index(name).await {
                ReadOutcome::Found(_) => found.push(*provider),
                ReadOutcome::NotFound => {}
                ReadOutcome::Unavailable(err) => {
                    warn!(
                        index = %name,
                        %provider,
                        error = %err,
                        "backend unavailable during route lookup"
                    );
                }
            }
        }
        found
    }

    /// The backend owning `name`, asking every backend on a cache miss.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn ChunkStore>> {
        if let Some(provider) = self.routes.read().await.get(name).copied() {
            return self.backend(provider).cloned();
        }
        let claimants = self.claimants(name).await;
        let provider = match claimants.as_slice() {
            [] => return Err(Error::NotFound(format!("index '{name}'"))),
            [only] => *only,
            [first, ..] => {
                warn!(
                    index = %name,
                    claimants = ?claimants,
                    "index name claimed by several backends, using the first"
                );
                *first
            }
        };
        debug!(index = %name, %provider, "route learned");
        self.routes.write().await.insert(name.to_string(), provider);
        self.backend(provider).cloned()
    }

    /// Create `spec` on `provider`, refusing names any backend already holds.
    pub async fn create_index(
        &self,
        provider: BackendProvider,
        spec: &IndexSpec,
    ) -> Result<IndexHandle> {
        let store = self.backend(provider)?.clone();
        let mut routes = self.routes.write().await;
        let existing = match routes.get(&spec.name) {
            Some(owner) => vec![*owner],
            None => self.claimants(&spec.name).await,
        };
        if let Some(owner) = existing.first() {
            return Err(if *owner == provider {
                Error::AlreadyExists(spec.name.clone())
            } else {
                Error::NameConflict { name: spec.name.clone(), provider: owner.to_string() }
            });
        }
        let handle = store.create_index(spec).await?;
        routes.insert(spec.name.clone(), provider);
        info!(index = %spec.name, %provider, "index created");
        Ok(handle)
    }

    pub async fn drop_index(&self, name: &str) -> Result<()> {
        let store = self.resolve(name).await?;
        store.drop_index(name).await?;
        self.routes.write().await.remove(name);
        info!(index = %name, provider = %store.provider(), "index dropped");
        Ok(())
    }

    pub async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo> {
        match self.resolve(name).await {
            Ok(store) => store.get_index(name).await,
            Err(err) => ReadOutcome::capture("get_index", name, Err(err)),
        }
    }

    /// Indexes across every backend; unreachable backends are skipped.
    pub async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>> {
        let mut all = Vec::new();
        for (provider, store) in &self.backends {
            match store.get_indexes().await {
                ReadOutcome::Found(infos) => all.extend(infos),
                ReadOutcome::NotFound => {}
                ReadOutcome::Unavailable(err) => {
                    warn!(%provider, error = %err, "backend skipped in index listing");
                }
            }
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        ReadOutcome::Found(all)
    }

    pub async fn number_chunks(&self, name: &str) -> ReadOutcome<u64> {
        match self.resolve(name).await {
            Ok(store) => store.number_chunks(name).await,
            Err(err) => ReadOutcome::capture("number_chunks", name, Err(err)),
        }
    }

    /// Close every backend; the first failure is returned after all were tried.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for (provider, store) in &self.backends {
            if let Err(err) = store.close().await {
                warn!(%provider, error = %err, "backend close failed");
                first_error.get_or_insert(err);
            }
        }
        self.routes.write().await.clear();
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ChunkWriter for IndexRouter {
    async fn index_chunks(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        self.resolve(&params.index_name).await?.index_chunks(chunks, embeddings, params).await
    }

    async fn delete_chunks(&self, ids: &[ChunkId], params: &DeleteParams) -> Result<()> {
        self.resolve(&params.index_name).await?.delete_chunks(ids, params).await
    }

    async fn delete_chunks_matching(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()> {
        let store = self.resolve(&params.index_name).await?;
        store.delete_chunks_matching(query_text, attrs, params).await
    }

    fn retry_policy(&self) -> RetryPolicy { self.retry }
}

#[async_trait]
impl QueryEngine for IndexRouter {
    async fn search(&self, request: &SearchRequest) -> ReadOutcome<Vec<ScoredChunk>> {
        match self.resolve(&request.index_name).await {
            Ok(store) => store.search(request).await,
            Err(err) => ReadOutcome::capture("search", &request.index_name, Err(err)),
        }
    }

    async fn get_chunks(&self, index_name: &str, ids: &[ChunkId]) -> ReadOutcome<Vec<Chunk>> {
        match self.resolve(index_name).await {
            Ok(store) => store.get_chunks(index_name, ids).await,
            Err(err) => ReadOutcome::capture("get_chunks", index_name, Err(err)),
        }
    }
}
