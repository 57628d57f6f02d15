use tempfile::TempDir;

use chunkdb_core::config::TantivySettings;
use chunkdb_core::retry::CallOptions;
use chunkdb_core::types::{
    Attributes, Chunk, DeleteParams, IndexSpec, LogicalType, Scalar, ScoreKind, SearchRequest,
    WriteParams,
};
use chunkdb_core::{ChunkStore, ChunkWriter, Error, IndexLifecycle, QueryEngine};
use chunkdb_text::TantivyStore;

fn store(tmp: &TempDir) -> TantivyStore {
    let settings = TantivySettings {
        root_dir: tmp.path().to_string_lossy().to_string(),
        writer_heap_bytes: 15_000_000,
    };
    TantivyStore::new(&settings, CallOptions::default()).expect("store")
}

fn corpus() -> Vec<Chunk> {
    let mut manual =
        Chunk::new("c3", "Replacing filter cartridges on the pump").with_data("category", "faq");
    manual.metadata.parent_ids = vec!["sec-1".into(), "sec-2".into()];
    vec![
        Chunk::new("c1", "How do I prime the pump")
            .with_data("category", "faq")
            .with_data("rank", 1i64),
        Chunk::new("c2", "Winter storage guide for water tanks")
            .with_data("category", "guide")
            .with_data("rank", 2i64),
        manual,
    ]
}

fn vectors() -> Vec<Vec<f32>> {
    vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.6, 0.0, 0.8]]
}

async fn seeded(tmp: &TempDir) -> TantivyStore {
    let store = store(tmp);
    store.create_index(&IndexSpec::new("docs-v1", 3)).await.expect("create");
    let vectors = vectors();
    let params = WriteParams::new("docs-v1");
    store.index_chunks(&corpus(), Some(&vectors), &params).await.expect("index");
    store
}

#[tokio::test]
async fn keyword_search_ranks_matching_text() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;
    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(3));

    let request = SearchRequest::new("docs-v1").with_text("pump");
    let hits = store.search(&request).await.into_option().expect("hits");
    let ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"c1") && ids.contains(&"c3"));
    assert!(hits[0].score >= hits[1].score);
    assert_eq!(hits[0].score_kind, ScoreKind::Similarity);
}

#[tokio::test]
async fn common_words_are_searchable() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;

    let request = SearchRequest::new("docs-v1").with_text("the");
    let hits = store.search(&request).await.into_option().expect("hits");
    let mut ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["c1", "c3"]);

    let request = SearchRequest::new("docs-v1").with_text("How do I");
    let hits = store.search(&request).await.into_option().expect("hits");
    assert_eq!(hits.first().map(|h| h.chunk.id.as_str()), Some("c1"));
}

#[tokio::test]
async fn attribute_filters_and_or() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;

    let request = SearchRequest::new("docs-v1").with_attr("category", "faq");
    let faq = store.search(&request).await.unwrap_or_default();
    assert!(faq.iter().all(|h| h.chunk.data.get("category") == Some(&Scalar::from("faq"))));
    assert_eq!(faq.len(), 2);

    let request = SearchRequest::new("docs-v1").with_attr("rank", 2i64);
    let numeric = store.search(&request).await.unwrap_or_default();
    assert_eq!(numeric.len(), 1);
    assert_eq!(numeric[0].chunk.id, "c2");

    let request = SearchRequest::new("docs-v1").with_attr("parentIds", "sec-2");
    let parent = store.search(&request).await.unwrap_or_default();
    assert_eq!(parent.len(), 1);
    assert_eq!(parent[0].chunk.id, "c3");

    let mut attrs = Attributes::new();
    attrs.insert("category".into(), Scalar::from("guide"));
    attrs.insert("rank".into(), Scalar::from(1i64));
    let both = SearchRequest { attrs: attrs.clone(), ..SearchRequest::new("docs-v1") };
    assert!(store.search(&both).await.unwrap_or_default().is_empty());
    let either =
        SearchRequest { attrs, logical_type: LogicalType::Or, ..SearchRequest::new("docs-v1") };
    assert_eq!(store.search(&either).await.unwrap_or_default().len(), 2);
}

#[tokio::test]
async fn vector_and_hybrid_search() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;

    let own = SearchRequest::new("docs-v1").with_embedding(vec![0.0, 1.0, 0.0]).with_k(1);
    let hits = store.search(&own).await.into_option().expect("hits");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.id, "c2");
    assert!((hits[0].score - 1.0).abs() < 1e-5);

    let hybrid = SearchRequest::new("docs-v1")
        .with_text("cartridges")
        .with_embedding(vec![1.0, 0.0, 0.0])
        .with_k(2);
    let hits = store.search(&hybrid).await.into_option().expect("hits");
    let ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    assert_eq!(hits.len(), 2);
    assert!(ids.contains(&"c1") && ids.contains(&"c3"));
    assert!(hits.iter().all(|h| h.score <= 1.0 + 1e-6));

    let bad = SearchRequest::new("docs-v1").with_embedding(vec![1.0]);
    assert!(store.search(&bad).await.is_unavailable());
}

#[tokio::test]
async fn writes_upsert_and_delete() {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp).await;
    let params = WriteParams::new("docs-v1").with_node_label("Note");

    let updated = Chunk::new("c1", "Prime the pump slowly");
    store.index_chunk(&updated, Some(&[1.0, 0.0, 0.0]), &params).await.expect("upsert");
    let ids = ["c1".to_string(), "zzz".to_string()];
    let fetched = store.get_chunks("docs-v1", &ids).await.into_option().expect("fetch");
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].text, "Prime the pump slowly");
    assert_eq!(fetched[0].node_label, "Note");
    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(3));

    let delete = DeleteParams::new("docs-v1");
    store.delete_chunk("does-not-exist", &delete).await.expect("no-op");
    let no_attrs = Attributes::new();
    store.delete_chunks_matching(Some("winter"), &no_attrs, &delete).await.expect("delete by text");
    assert_eq!(store.number_chunks("docs-v1").await.into_option(), Some(2));

    let err = store.delete_chunks_matching(Some(" "), &no_attrs, &delete).await.expect_err("empty");
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn lifecycle_survives_reopen() {
    let tmp = TempDir::new().expect("tmp");
    {
        let store = seeded(&tmp).await;
        store.close().await.expect("close");
    }
    let store = store(&tmp);
    let indexes = store.get_indexes().await.into_option().expect("indexes");
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].document_count, 3);

    let err = store.create_index(&IndexSpec::new("docs-v1", 3)).await.expect_err("exists");
    assert!(matches!(err, Error::AlreadyExists(_)));

    store.drop_index("docs-v1").await.expect("drop");
    assert!(store.drop_index("docs-v1").await.expect_err("gone").is_not_found());
    assert!(store.get_chunks("docs-v1", &["c1".into()]).await.unwrap_or_default().is_empty());
    assert!(store.get_index("docs-v1").await.is_not_found());
}
