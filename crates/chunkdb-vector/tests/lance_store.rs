use tempfile::TempDir;

use chunkdb_core::config::LanceSettings;
use chunkdb_core::retry::CallOptions;
use chunkdb_core::types::{
    Attributes, Chunk, DeleteParams, IndexSpec, LogicalType, Scalar, ScoreKind, SearchMode,
    SearchRequest, WriteParams,
};
use chunkdb_core::{ChunkWriter, Error, IndexLifecycle, QueryEngine};
use chunkdb_vector::LanceStore;

async fn store(tmp: &TempDir) -> LanceStore {
    let settings = LanceSettings { uri: tmp.path().join("lance").to_string_lossy().to_string() };
    LanceStore::connect(&settings, CallOptions::default()).await.expect("connect")
}

fn chunk(id: &str, text: &str, category: &str, embedding: [f32; 4]) -> Chunk {
    Chunk::new(id, text).with_data("category", category).with_embedding(embedding.to_vec())
}

fn corpus() -> Vec<Chunk> {
    vec![
        chunk("c1", "Prime the pump before first use", "faq", [1.0, 0.0, 0.0, 0.0]),
        chunk("c2", "Pump maintenance schedule", "guide", [0.0, 1.0, 0.0, 0.0]),
        chunk("c3", "Filter cartridges and pump seals", "faq", [0.0, 0.0, 1.0, 0.0]),
    ]
}

async fn seeded(tmp: &TempDir) -> LanceStore {
    let store = store(tmp).await;
    store.create_index(&IndexSpec::new("docs-v1", 4)).await.expect("create");
    let params = WriteParams::new("docs-v1");
    let ids = store.index_chunks(&corpus(), None, &params).await.expect("index");
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
    store
}

#[tokio::test]
async fn create_index_then_search_own_vector() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;

    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(3));
    let info = store.get_index("docs-v1").await.into_option().expect("info");
    assert_eq!(info.embedding_dimension, Some(4));

    let request = SearchRequest::new("docs-v1").with_embedding(vec![0.0, 1.0, 0.0, 0.0]).with_k(2);
    let hits = store.search(&request).await.into_option().expect("hits");
    assert_eq!(hits[0].chunk.id, "c2");
    assert_eq!(hits[0].score_kind, ScoreKind::Distance);
    assert!(hits[0].score.abs() < 1e-4, "self distance is ~0, got {}", hits[0].score);
    assert!(hits.len() <= 2);
}

#[tokio::test]
async fn keyword_search_filters_by_attribute() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;

    let faq = SearchRequest::new("docs-v1").with_attr("category", "faq");
    let hits = store.search(&faq).await.unwrap_or_default();
    let mut ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["c1", "c3"]);

    let mut attrs = Attributes::new();
    attrs.insert("category".into(), Scalar::from("guide"));
    let text_and_attr =
        SearchRequest { query_text: Some("pump".into()), attrs, ..SearchRequest::new("docs-v1") };
    let hits = store.search(&text_and_attr).await.unwrap_or_default();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.id, "c2");

    let either = SearchRequest::new("docs-v1")
        .with_text("cartridges")
        .with_attr("category", "guide")
        .with_logical(LogicalType::Or);
    assert_eq!(store.search(&either).await.unwrap_or_default().len(), 2);
}

#[tokio::test]
async fn hybrid_search_returns_similarity_scores() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;
    let request = SearchRequest::new("docs-v1")
        .with_text("seals")
        .with_embedding(vec![1.0, 0.0, 0.0, 0.0])
        .with_k(3);
    assert_eq!(request.effective_mode(), SearchMode::Hybrid);
    let hits = store.search(&request).await.into_option().expect("hits");
    assert!(hits.iter().all(|h| h.score_kind == ScoreKind::Similarity));
    let ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    assert!(ids.contains(&"c1") && ids.contains(&"c3"));
}

#[tokio::test]
async fn upsert_replaces_and_deletes_are_idempotent() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;
    let params = WriteParams::new("docs-v1");

    let updated = Chunk::new("c1", "Prime the pump twice").with_embedding(vec![1.0, 0.0, 0.0, 0.0]);
    store.index_chunk(&updated, None, &params).await.expect("upsert");
    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(3));
    let fetched =
        store.get_chunks("docs-v1", &["c1".to_string()]).await.into_option().expect("fetch");
    assert_eq!(fetched[0].text, "Prime the pump twice");
    assert_eq!(fetched[0].embedding.as_deref(), Some(&[1.0, 0.0, 0.0, 0.0][..]));

    let delete = DeleteParams::new("docs-v1");
    store.delete_chunk("missing", &delete).await.expect("no-op delete");
    store.delete_chunks(&["c2".to_string()], &delete).await.expect("delete");
    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(2));

    let mut attrs = Attributes::new();
    attrs.insert("category".into(), Scalar::from("faq"));
    store.delete_chunks_matching(None, &attrs, &delete).await.expect("delete faq");
    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(1));

    let err = store
        .delete_chunks_matching(None, &Attributes::new(), &delete)
        .await
        .expect_err("empty criteria");
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn dimension_mismatch_and_missing_index() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;

    let bad = Chunk::new("x", "short vector").with_embedding(vec![1.0, 0.0]);
    let params = WriteParams::new("docs-v1");
    let err = store.index_chunks(&[bad], None, &params).await.expect_err("mismatch");
    assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 2, .. }));

    let err = store.create_index(&IndexSpec::new("docs-v1", 4)).await.expect_err("duplicate");
    assert!(matches!(err, Error::AlreadyExists(_)));

    let err = store.drop_index("nope").await.expect_err("missing");
    assert!(err.is_not_found());

    let outcome = store.get_chunks("nope", &["a".to_string()]).await;
    assert!(outcome.is_not_found());
    assert!(outcome.unwrap_or_default().is_empty());

    store.drop_index("docs-v1").await.expect("drop");
    assert!(store.get_index("docs-v1").await.is_not_found());
    assert!(store.get_indexes().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn filtered_vector_search_widens_past_nearer_misses() {
    let tmp = TempDir::new().expect("tmp");
    let store = store(&tmp).await;
    store.create_index(&IndexSpec::new("docs-v1", 4)).await.expect("create");

    let mut chunks: Vec<Chunk> = (0..10)
        .map(|i| chunk(&format!("b{i}"), "blog post", "blog", [1.0, 0.01 * i as f32, 0.0, 0.0]))
        .collect();
    chunks.push(chunk("f1", "pump faq", "faq", [0.0, 0.0, 1.0, 0.0]));
    chunks.push(chunk("f2", "seal faq", "faq", [0.0, 0.0, 0.9, 0.1]));
    let params = WriteParams::new("docs-v1");
    store.index_chunks(&chunks, None, &params).await.expect("index");

    let request = SearchRequest::new("docs-v1")
        .with_embedding(vec![1.0, 0.0, 0.0, 0.0])
        .with_attr("category", "faq")
        .with_k(2);
    let hits = store.search(&request).await.into_option().expect("hits");
    let mut ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["f1", "f2"]);
}
