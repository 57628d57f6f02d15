#![allow(dead_code)]

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use chunkdb_core::config::RemoteSettings;
use chunkdb_core::retry::{CallOptions, RetryPolicy};
use chunkdb_remote::RemoteStore;

pub fn settings(server: &MockServer, flush_interval_ms: u64) -> RemoteSettings {
    RemoteSettings {
        endpoint: server.uri(),
        api_key: Some("test-key".into()),
        batch_size: 100,
        flush_interval_ms,
        queue_capacity: 1_000,
    }
}

pub fn store(server: &MockServer, flush_interval_ms: u64) -> RemoteStore {
    let retry = RetryPolicy { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 5 };
    let options = CallOptions { retry, ..CallOptions::default() };
    RemoteStore::connect(&settings(server, flush_interval_ms), options).expect("store")
}

pub fn definition(name: &str, dimension: usize) -> Value {
    json!({
        "name": name,
        "nodeLabel": "Chunk",
        "fields": [
            {"name": "id", "type": "Edm.String", "key": true, "filterable": true},
            {"name": "nodeLabel", "type": "Edm.String", "filterable": true},
            {
                "name": "vector",
                "type": "Collection(Edm.Single)",
                "dimensions": dimension,
                "similarity": "cosine"
            },
            {"name": "Chunk__text", "type": "Edm.String", "searchable": true}
        ]
    })
}

/// Serve `GET /indexes/{name}` and accept bulk writes for it.
pub async fn mount_index(server: &MockServer, name: &str, dimension: usize) {
    Mock::given(method("GET"))
        .and(path(format!("/indexes/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(definition(name, dimension)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/indexes/{name}/docs/index")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(server)
        .await;
}

/// Document arrays of every bulk request received so far, in arrival order.
pub async fn bulk_bodies(server: &MockServer, name: &str) -> Vec<Vec<Value>> {
    let target = format!("/indexes/{name}/docs/index");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r: &&Request| r.url.path() == target)
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).expect("json body");
            body["value"].as_array().cloned().unwrap_or_default()
        })
        .collect()
}

pub fn hit(id: &str, text: &str, category: &str, score: f64) -> Value {
    json!({
        "@score": score,
        "id": id,
        "nodeLabel": "Chunk",
        "Chunk__id": id,
        "Chunk__nodeLabel": "Chunk",
        "Chunk__text": text,
        "Chunk__data__category": category
    })
}
