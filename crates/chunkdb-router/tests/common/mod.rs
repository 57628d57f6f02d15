#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chunkdb_core::filter::{lexical_score, require_criteria, Criteria};
use chunkdb_core::types::{
    pair_embeddings, Attributes, BackendProvider, Chunk, ChunkId, DeleteParams, IndexHandle,
    IndexInfo, IndexSpec, ScoredChunk, SearchRequest, WriteParams,
};
use chunkdb_core::{
    ChunkStore, ChunkWriter, Error, IndexLifecycle, QueryEngine, ReadOutcome, Result,
};

/// In-memory backend that reports itself as any provider.
pub struct MemoryStore {
    provider: BackendProvider,
    indexes: Mutex<BTreeMap<String, (IndexSpec, BTreeMap<ChunkId, Chunk>)>>,
    offline: AtomicBool,
    pub closed: AtomicBool,
    fail_close: bool,
}

impl MemoryStore {
    pub fn new(provider: BackendProvider) -> Self {
        Self {
            provider,
            indexes: Mutex::new(BTreeMap::new()),
            offline: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_close: false,
        }
    }

    pub fn failing_close(provider: BackendProvider) -> Self {
        Self { fail_close: true, ..Self::new(provider) }
    }

    /// Seed an index as if an earlier process had created it.
    pub fn with_index(self, name: &str) -> Self {
        let seeded = (IndexSpec::new(name, 3), BTreeMap::new());
        self.indexes.lock().unwrap().insert(name.to_string(), seeded);
        self
    }

    pub fn set_offline(&self, offline: bool) { self.offline.store(offline, Ordering::SeqCst); }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::transient("memory", "backend offline"))
        } else {
            Ok(())
        }
    }

    fn info(&self, spec: &IndexSpec, count: usize) -> IndexInfo {
        IndexInfo {
            name: spec.name.clone(),
            provider: self.provider,
            native_name: Some(spec.name.clone()),
            node_label: Some(spec.node_label.clone()),
            embedding_dimension: Some(spec.embedding_dimension),
            similarity: Some(spec.similarity),
            document_count: count as u64,
        }
    }
}

#[async_trait]
impl IndexLifecycle for MemoryStore {
    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexHandle> {
        self.check_online()?;
        spec.validate()?;
        let mut indexes = self.indexes.lock().unwrap();
        if indexes.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(spec.name.clone()));
        }
        indexes.insert(spec.name.clone(), (spec.clone(), BTreeMap::new()));
        Ok(IndexHandle {
            name: spec.name.clone(),
            provider: self.provider,
            native_name: spec.name.clone(),
        })
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.check_online()?;
        match self.indexes.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("index '{name}'"))),
        }
    }

    async fn get_index(&self, name: &str) -> ReadOutcome<IndexInfo> {
        let result = self.check_online().and_then(|()| {
            let indexes = self.indexes.lock().unwrap();
            indexes
                .get(name)
                .map(|(spec, chunks)| self.info(spec, chunks.len()))
                .ok_or_else(|| Error::NotFound(format!("index '{name}'")))
        });
        ReadOutcome::capture("get_index", name, result)
    }

    async fn get_indexes(&self) -> ReadOutcome<Vec<IndexInfo>> {
        let result = self.check_online().map(|()| {
            let indexes = self.indexes.lock().unwrap();
            indexes.values().map(|(spec, chunks)| self.info(spec, chunks.len())).collect()
        });
        ReadOutcome::capture("get_indexes", "*", result)
    }

    async fn number_chunks(&self, name: &str) -> ReadOutcome<u64> {
        self.get_index(name).await.map(|i| i.document_count)
    }
}

#[async_trait]
impl ChunkWriter for MemoryStore {
    async fn index_chunks(
        &self,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
        params: &WriteParams,
    ) -> Result<Vec<ChunkId>> {
        self.check_online()?;
        let pairs = pair_embeddings(chunks, embeddings)?;
        let mut indexes = self.indexes.lock().unwrap();
        let (_, stored) = indexes
            .get_mut(&params.index_name)
            .ok_or_else(|| Error::NotFound(format!("index '{}'", params.index_name)))?;
        let mut ids = Vec::with_capacity(pairs.len());
        for (chunk, vector) in pairs {
            let mut chunk = chunk.clone().with_node_label(params.label_for(chunk).to_string());
            chunk.embedding = vector.map(<[f32]>::to_vec);
            ids.push(chunk.id.clone());
            stored.insert(chunk.id.clone(), chunk);
        }
        Ok(ids)
    }

    async fn delete_chunks(&self, ids: &[ChunkId], params: &DeleteParams) -> Result<()> {
        self.check_online()?;
        if let Some((_, stored)) = self.indexes.lock().unwrap().get_mut(&params.index_name) {
            for id in ids {
                stored.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_chunks_matching(
        &self,
        query_text: Option<&str>,
        attrs: &Attributes,
        params: &DeleteParams,
    ) -> Result<()> {
        require_criteria(query_text, attrs)?;
        let criteria = Criteria::new(query_text, attrs, Default::default());
        if let Some((_, stored)) = self.indexes.lock().unwrap().get_mut(&params.index_name) {
            stored.retain(|_, chunk| !criteria.matches(chunk));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryEngine for MemoryStore {
    async fn search(&self, request: &SearchRequest) -> ReadOutcome<Vec<ScoredChunk>> {
        let result = self.check_online().and_then(|()| {
            let indexes = self.indexes.lock().unwrap();
            let (_, stored) = indexes
                .get(&request.index_name)
                .ok_or_else(|| Error::NotFound(format!("index '{}'", request.index_name)))?;
            let criteria = Criteria::new(request.text(), &request.attrs, request.logical_type);
            let mut hits: Vec<ScoredChunk> = stored
                .values()
                .filter(|c| criteria.matches(c))
                .map(|c| {
                    ScoredChunk::similarity(c.clone(), lexical_score(&c.text, &criteria.terms))
                })
                .collect();
            hits.truncate(request.k);
            Ok(hits)
        });
        ReadOutcome::capture("search", &request.index_name, result)
    }

    async fn get_chunks(&self, index_name: &str, ids: &[ChunkId]) -> ReadOutcome<Vec<Chunk>> {
        let indexes = self.indexes.lock().unwrap();
        let result = indexes
            .get(index_name)
            .map(|(_, stored)| ids.iter().filter_map(|id| stored.get(id).cloned()).collect())
            .ok_or_else(|| Error::NotFound(format!("index '{index_name}'")));
        ReadOutcome::capture("get_chunks", index_name, result)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    fn provider(&self) -> BackendProvider { self.provider }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            Err(Error::backend("memory", "close failed"))
        } else {
            Ok(())
        }
    }
}
