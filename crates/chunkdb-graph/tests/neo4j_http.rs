use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chunkdb_core::config::Neo4jSettings;
use chunkdb_core::Error;
use chunkdb_graph::{CypherExecutor, Neo4jHttp, Statement};

fn settings(server: &MockServer) -> Neo4jSettings {
    Neo4jSettings { url: server.uri(), password: "secret".into(), ..Neo4jSettings::default() }
}

#[tokio::test]
async fn rows_are_keyed_by_column() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "statements": [{"statement": "RETURN $x AS x, 2 AS y", "parameters": {"x": 1}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"columns": ["x", "y"], "data": [{"row": [1, 2]}, {"row": [3, 4]}]}],
            "errors": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let http = Neo4jHttp::new(&settings(&server), Duration::from_secs(5)).expect("client");
    let rows = http
        .run(Statement::new("RETURN $x AS x, 2 AS y").with_params(json!({"x": 1})))
        .await
        .expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["x"], 3);
    assert_eq!(rows[0]["y"], 2);
}

#[tokio::test]
async fn cypher_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{
                "code": "Neo.TransientError.Transaction.DeadlockDetected",
                "message": "deadlock"
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{
                "code": "Neo.ClientError.Schema.EquivalentSchemaRuleAlreadyExists",
                "message": "exists"
            }]
        })))
        .mount(&server)
        .await;

    let http = Neo4jHttp::new(&settings(&server), Duration::from_secs(5)).expect("client");
    let err = http.run(Statement::new("MATCH (n) RETURN n")).await.expect_err("transient");
    assert!(err.is_transient());
    let err = http.run(Statement::new("CREATE INDEX x")).await.expect_err("exists");
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn http_status_maps_to_error_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

    let http = Neo4jHttp::new(&settings(&server), Duration::from_secs(5)).expect("client");
    let err = http.run(Statement::new("RETURN 1")).await.expect_err("auth");
    assert!(matches!(err, Error::InvalidConfig(_)));
    let err = http.run(Statement::new("RETURN 1")).await.expect_err("unavailable");
    assert!(err.is_transient());
}
