use chrono::{TimeZone, Utc};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde_json::json;
use tempfile::TempDir;

use chunkdb_core::config::{resolve_with_base, Config};
use chunkdb_core::flatten::{chunk_from_flat, chunk_to_flat, flatten, unflatten};
use chunkdb_core::schema::{project_schema, FieldKind, ProjectionOptions};
use chunkdb_core::types::{Chunk, ChunkMetadata, Scalar, SearchMode, SearchRequest};

fn rich_chunk() -> Chunk {
    let mut chunk = Chunk::new("c-1", "Pumps need priming before first use.")
        .with_document("manual-7")
        .with_data("category", "maintenance")
        .with_data("pages", 12i64)
        .with_data("archived", false);
    chunk.kind = Some("paragraph".to_string());
    chunk.metadata = ChunkMetadata {
        author: Some("Ops".to_string()),
        parent_ids: vec!["s-1".to_string(), "s-2".to_string()],
        page: Some(3),
        ..ChunkMetadata::default()
    };
    chunk.created_date_time =
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).single().expect("date"));
    chunk.version = Some(2);
    chunk
}

#[test]
fn chunk_survives_flatten_round_trip() {
    let chunk = rich_chunk();
    for sep in [".", "__"] {
        let flat = chunk_to_flat(&chunk, sep).expect("flatten");
        assert!(flat.contains_key(&format!("metadata{sep}author")));
        assert_eq!(flat.get(&format!("data{sep}pages")), Some(&json!(12.0)));
        let back = chunk_from_flat(&flat, sep).expect("unflatten");
        assert_eq!(back, chunk);
    }
}

#[test]
fn unflatten_inverts_flatten_for_nested_values() {
    let value = json!({
        "a": {"b": {"c": 1, "d": [1, 2, 3]}, "e": "x"},
        "f": null,
        "g": {}
    });
    let flat = flatten(&value, "__").expect("flatten");
    assert_eq!(flat.len(), 5);
    assert_eq!(unflatten(&flat, "__").expect("unflatten"), value);
}

#[test]
fn chunk_label_gets_system_fields_and_refs_resolve() {
    let descriptor = json!({
        "$ref": "#/definitions/Chunk",
        "definitions": {
            "Chunk": {"type": "object", "properties": {
                "id": {"type": "string"},
                "data": {"$ref": "#/definitions/Data"}
            }},
            "Data": {"type": "object", "properties": {
                "category": {"type": "string"},
                "pages": {"type": "integer"},
                "archived": {"type": "boolean"}
            }}
        }
    });
    let options = ProjectionOptions { separator: "__".to_string(), ..ProjectionOptions::default() };
    let projected = project_schema(&descriptor, &options).expect("project");

    assert_eq!(projected.get("data__category"), Some(FieldKind::FullText));
    assert_eq!(projected.get("data__pages"), Some(FieldKind::Numeric));
    assert_eq!(projected.get("data__archived"), Some(FieldKind::Exact));
    assert_eq!(projected.get("metadata__page"), Some(FieldKind::Numeric));
    assert_eq!(projected.get("documentId"), Some(FieldKind::Exact));
    assert_eq!(projected.get("embedding"), Some(FieldKind::Vector));
    assert!(projected.scalar_fields().all(|(_, kind)| kind != FieldKind::Vector));
}

#[test]
fn unknown_reference_is_an_error() {
    let descriptor = json!({"properties": {"x": {"$ref": "#/definitions/Missing"}}});
    assert!(project_schema(&descriptor, &ProjectionOptions::default()).is_err());
}

#[test]
fn search_mode_is_inferred_from_inputs() {
    let keyword = SearchRequest::new("idx").with_text("pump");
    assert_eq!(keyword.effective_mode(), SearchMode::Keyword);
    let vector = SearchRequest::new("idx").with_embedding(vec![0.1, 0.2]);
    assert_eq!(vector.effective_mode(), SearchMode::Vector);
    let hybrid = SearchRequest::new("idx").with_text("pump").with_embedding(vec![0.1, 0.2]);
    assert_eq!(hybrid.effective_mode(), SearchMode::Hybrid);
    let blank = SearchRequest::new("idx").with_text("   ").with_embedding(vec![0.1]);
    assert_eq!(blank.effective_mode(), SearchMode::Vector);
    assert_eq!(keyword.with_mode(SearchMode::Vector).effective_mode(), SearchMode::Vector);
    assert!(SearchRequest::new("idx").require_embedding().is_err());
}

#[test]
fn scalar_rendering_is_stable() {
    assert_eq!(Scalar::from(3i64).render(), "3");
    assert_eq!(Scalar::from(2.5).render(), "2.5");
    assert_eq!(Scalar::from(true).render(), "true");
    assert!(Scalar::from("x").matches_json(&json!(["y", "x"])));
}

#[test]
fn settings_fill_defaults_and_read_sections() {
    let figment = Figment::new().merge(Toml::string(
        r#"
        [lancedb]
        uri = "/tmp/lance"

        [remote]
        endpoint = "http://search.local"
        batch_size = 25

        [call]
        deadline_ms = 500
        "#,
    ));
    let settings = Config::from_figment(figment).settings().expect("settings");
    assert_eq!(settings.lancedb.uri, "/tmp/lance");
    assert_eq!(settings.tantivy.root_dir, "data/tantivy");
    let remote = settings.remote.expect("remote section");
    assert_eq!(remote.batch_size, 25);
    assert_eq!(remote.flush_interval_ms, 1_000);
    assert!(settings.neo4j.is_none());
    assert_eq!(settings.call.deadline_ms, 500);
    assert_eq!(settings.call.retry.max_attempts, 3);
}

#[test]
fn config_get_reports_missing_keys() {
    let config = Config::from_figment(Figment::new());
    assert!(config.get::<String>("lancedb.uri").is_err());
}

#[test]
fn relative_paths_resolve_against_base() {
    let tmp = TempDir::new().expect("tempdir");
    let base = tmp.path();
    assert_eq!(resolve_with_base(base, "data/idx"), base.join("data/idx"));
    let absolute = base.join("abs");
    let absolute_str = absolute.to_string_lossy().to_string();
    assert_eq!(resolve_with_base(base, &absolute_str), absolute);
}
