//! HTTP API tests driven through the router without binding a socket.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use lora_serve::config::Config;
use lora_serve::inference::SimulatedEngine;
use lora_serve::server::api::{build_router, AppState};
use lora_serve::LoraServe;

async fn app(root: &std::path::Path) -> (Router, Arc<LoraServe>) {
    let mut config = Config::default();
    config.adapters.root = root.to_path_buf();
    config.scheduler.max_wait_ms = 5;
    let serve = Arc::new(
        LoraServe::start(config, Arc::new(SimulatedEngine::new("sim")), None)
            .await
            .unwrap(),
    );
    let router = build_router(Arc::new(AppState::new(Arc::clone(&serve))));
    (router, serve)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_generate_returns_text_and_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router
        .oneshot(post("/v1/generate", json!({ "prompt": "hello", "max_tokens": 5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tokens"], 5);
    assert_eq!(body["text"].as_str().unwrap().split_whitespace().count(), 5);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_missing_adapter_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router
        .oneshot(post(
            "/v1/generate",
            json!({ "prompt": "hello", "max_tokens": 5, "adapter_id": "ghost" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "adapter_not_found");
    assert_eq!(body["error"]["retryable"], false);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_zero_max_tokens_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router
        .oneshot(post("/v1/generate", json!({ "prompt": "hello", "max_tokens": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "invalid_request");
    serve.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_state() {
    let dir = tempfile::tempdir().unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["speculative"], false);
    assert!(body["uptime_secs"].as_u64().unwrap() <= serve.uptime_secs());

    serve.shutdown().await;
    let body = body_json(router.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["status"], "shutting_down");
}

#[tokio::test]
async fn test_metrics_exposes_request_counter() {
    let dir = tempfile::tempdir().unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router
        .clone()
        .oneshot(post("/v1/generate", json!({ "prompt": "count me", "max_tokens": 2 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("lora_serve_requests_total"));
    assert!(text.contains("lora_serve_kv_free_blocks"));
    serve.shutdown().await;
}

#[tokio::test]
async fn test_cache_stats() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("math")).unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router
        .clone()
        .oneshot(post(
            "/v1/generate",
            json!({ "prompt": "solve", "max_tokens": 2, "adapter_id": "math" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(router.oneshot(get("/v1/cache/stats")).await.unwrap()).await;
    assert_eq!(body["kv"]["capacity_blocks"], 4096);
    assert_eq!(body["kv"]["used_blocks"], 0);
    assert_eq!(body["adapters"]["resident"], 1);
    assert_eq!(body["adapters"]["lru_order"], json!(["math"]));
    serve.shutdown().await;
}

#[tokio::test]
async fn test_stream_ends_with_done_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let (router, serve) = app(dir.path()).await;

    let response = router
        .oneshot(post("/v1/generate/stream", json!({ "prompt": "stream", "max_tokens": 3 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();

    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data.len(), 3 + 1 + 1);
    assert_eq!(data.last(), Some(&"[DONE]"));
    let last: Value = serde_json::from_str(data[3]).unwrap();
    assert_eq!(last["finish_reason"], "stop");
    assert_eq!(last["tokens"], 3);
    serve.shutdown().await;
}
