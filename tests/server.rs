//! Integration tests for the HTTP API.
//!
//! The router is served on an ephemeral port bound before the server task
//! starts, so requests never race the listener.

use coderank::config::Config;
use coderank::ingest::ingest_directory;
use coderank::server;
use coderank::service::RetrievalService;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("data").join("crk.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

[retrieval]
final_limit = 5

[server]
bind = "127.0.0.1:0"
"#,
        db_path.display()
    );
    toml::from_str(&config_content).unwrap()
}

/// Start a server over a corpus of `(path, body)` files; returns its base URL.
async fn start_server(tmp: &TempDir, files: &[(&str, &str)]) -> (String, Arc<RetrievalService>) {
    let corpus = tmp.path().join("corpus");
    std::fs::create_dir_all(&corpus).unwrap();
    for (name, body) in files {
        std::fs::write(corpus.join(name), body).unwrap();
    }

    let cfg = test_config(tmp);
    let service = Arc::new(RetrievalService::open(&cfg).await.unwrap());
    ingest_directory(service.pool().unwrap(), &cfg.ingest, &corpus)
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = service.clone();
    tokio::spawn(async move {
        server::serve(handle, listener).await.ok();
    });
    (format!("http://127.0.0.1:{}", port), service)
}

#[tokio::test]
async fn test_health_reports_active_generation() {
    let tmp = TempDir::new().unwrap();
    let (base, _service) = start_server(&tmp, &[("a.txt", "HRD-442")]).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_generation"], 0);
}

#[tokio::test]
async fn test_reindex_then_search() {
    let tmp = TempDir::new().unwrap();
    let (base, _service) = start_server(
        &tmp,
        &[
            ("a.txt", "Cooling fan for HRD-442 units."),
            ("b.txt", "Cooling fan for HRD-4420 units."),
        ],
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/reindex", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["generation"], 1);
    assert_eq!(report["documents"], 2);
    assert_eq!(report["inconsistencies"], 0);

    let resp = client
        .post(format!("{}/search", base))
        .json(&json!({ "query": "HRD-442", "mode": "exact" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["mode"], "exact");
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["doc_id"], "a.txt");
    assert_eq!(results[0]["match_type"], "exact_code");
    assert_eq!(results[0]["metadata"]["filename"], "a.txt");

    // Default mode is fused.
    let body: Value = client
        .post(format!("{}/search", base))
        .json(&json!({ "query": "HRD-442 cooling" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["mode"], "fused");
    assert_eq!(body["results"][0]["doc_id"], "a.txt");
}

#[tokio::test]
async fn test_search_rejects_bad_requests() {
    let tmp = TempDir::new().unwrap();
    let (base, _service) = start_server(&tmp, &[("a.txt", "HRD-442")]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/search", base))
        .json(&json!({ "query": "HRD-442", "mode": "semantic" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/search", base))
        .json(&json!({ "query": "HRD-442", "top_k": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_rollback_without_previous_is_404() {
    let tmp = TempDir::new().unwrap();
    let (base, _service) = start_server(&tmp, &[("a.txt", "HRD-442")]).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/reindex", base))
        .send()
        .await
        .unwrap();
    let resp = client
        .post(format!("{}/rollback", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_previous_generation");

    client
        .post(format!("{}/reindex", base))
        .send()
        .await
        .unwrap();
    let body: Value = client
        .post(format!("{}/rollback", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["active_generation"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let tmp = TempDir::new().unwrap();
    let (base, service) = start_server(&tmp, &[("a.txt", "EX-3 camera")]).await;
    service.reindex().await.unwrap();
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .post(format!("{}/search", base))
            .json(&json!({ "query": "EX-3" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let body: Value = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["active_generation"], 1);
    assert_eq!(body["reindex_mutex_state"], "idle");
    assert_eq!(body["cache_size"], 1);
    assert_eq!(body["cache_hit_rate"], 0.5);
    assert_eq!(body["inflight_count"], 0);
    assert_eq!(body["stale_index_entries"], 0);
    assert!(body["last_reindex_timestamp"].is_i64());
}

#[tokio::test]
async fn test_reindex_completes_after_client_disconnects() {
    let tmp = TempDir::new().unwrap();
    let (base, service) = start_server(&tmp, &[("a.txt", "HRD-442")]).await;
    let addr = base.trim_start_matches("http://").to_string();

    // Send the request and hang up without reading the response.
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"POST /reindex HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    drop(stream);

    let mut active = 0;
    for _ in 0..100 {
        active = service.coordinator().active().id;
        if active == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(active, 1);

    let staged: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM index_generations WHERE state = 'staged'",
    )
    .fetch_one(service.pool().unwrap())
    .await
    .unwrap();
    assert_eq!(staged, 0);
}
