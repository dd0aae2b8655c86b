//! HTTP contract: status codes, error envelope and health report.

mod support;

use librarian::lifecycle::IndexStatus;
use librarian::server::run_server;
use serde_json::{json, Value};
use std::time::Duration;
use support::*;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait until the server answers at all; health is 503 before a load.
async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/api/v1/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if client.get(&url).send().await.is_ok() {
            return;
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

#[tokio::test]
async fn test_http_contract_before_and_after_load() {
    let h = Harness::new();
    publish(&h.bucket(), &manifest(), &corpus("")).await;
    let service = h.service();

    let port = find_free_port();
    let server = {
        let service = service.clone();
        let bind = format!("127.0.0.1:{}", port);
        tokio::spawn(async move {
            run_server(service, &bind).await.ok();
        })
    };
    wait_for_server(port).await;

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}/api/v1", port);

    // Before the first load: degraded health, 503 queries.
    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["index_status"], "NOT_STARTED");

    let resp = client
        .post(format!("{}/context", base))
        .json(&json!({ "query": "rate limiter" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    assert!(resp.headers().get("retry-after").is_some());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_ready");

    assert_eq!(service.start().await, IndexStatus::Loaded);

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["index_status"], "LOADED");
    assert_eq!(body["index_branch"], "main");
    assert_eq!(body["dataset_name"], DATASET);
    assert_eq!(body["reranker_status"], "disabled");
    assert_eq!(body["cache_status"], "ok");
    assert!(body["index_last_modified"].is_string());
    assert!(body["generation_id"].is_string());
    let cpu = body["resource_usage"]["cpu_load_percent"].as_f64().unwrap();
    let memory = body["resource_usage"]["memory_usage_percent"].as_f64().unwrap();
    assert!((0.0..=100.0).contains(&cpu));
    assert!((0.0..=100.0).contains(&memory));

    let resp = client
        .post(format!("{}/context", base))
        .json(&json!({ "query": "rate limiter", "max_results": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let context = body["context"].as_array().unwrap();
    assert_eq!(context.len(), 2);
    assert!(context[0]["content"].as_str().unwrap().contains("rate"));
    assert!(context[0]["score"].is_number());
    assert!(context[0]["metadata"].is_object());
    assert!(body["query_id"].is_string());
    assert!(body["processing_time_ms"].is_number());

    let resp = client
        .post(format!("{}/context", base))
        .json(&json!({ "query": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/context", base))
        .json(&json!({ "query": "ab" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/index/refresh", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    server.abort();
}
