//! HTTP front end tests
//!
//! Calls the request handler directly with in-memory requests.

mod common;

use bytes::Bytes;
use common::{payload, Harness, Script};
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use media_relay::health::HealthManager;
use media_relay::http_server::{handle_request, ResponseBody};
use media_relay::RelayError;
use tempfile::TempDir;

async fn send(harness: &Harness, method: Method, path: &str) -> hyper::Response<ResponseBody> {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let health = HealthManager::new(harness.context.clone());
    handle_request(request, &harness.pipeline, &health).await.unwrap()
}

async fn body_bytes(response: hyper::Response<ResponseBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_stream_miss_then_hit() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), 1 << 20, 2).await;
    let data = payload(70, 11);
    let record = harness.add_object("episode-1", 1, Script::bytes(data.clone()));

    let response = send(&harness, Method::GET, "/stream/episode-1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(response.headers()["content-length"], "70");
    assert_eq!(response.headers()["content-type"], "application/octet-stream");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_bytes(response).await, data);

    let store = harness.context.store.clone();
    let key = record.cache_key();
    common::eventually("entry committed", || store.lookup(&key).is_some()).await;

    let response = send(&harness, Method::GET, "/stream/episode-1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(body_bytes(response).await, data);
    assert_eq!(harness.remote.fetch_count(), 1);
}

#[tokio::test]
async fn test_head_never_fetches() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), 1 << 20, 2).await;
    harness.add_object("episode-2", 2, Script::bytes(payload(30, 1)));

    let response = send(&harness, Method::HEAD, "/stream/episode-2").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(response.headers()["content-length"], "30");
    assert!(body_bytes(response).await.is_empty());
    assert_eq!(harness.remote.fetch_count(), 0);
}

#[tokio::test]
async fn test_unknown_routes_and_objects() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), 1 << 20, 2).await;

    for path in ["/", "/stream/", "/stream/a/b", "/videos/1", "/stream/missing"] {
        let response = send(&harness, Method::GET, path).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {}", path);
    }
}

#[tokio::test]
async fn test_non_read_methods_are_rejected() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), 1 << 20, 2).await;

    for method in [Method::POST, Method::PUT, Method::DELETE] {
        let response = send(&harness, method, "/stream/anything").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()["allow"], "GET, HEAD");
    }
}

#[tokio::test]
async fn test_transient_upstream_maps_to_503() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), 1 << 20, 2).await;
    let script = Script {
        open_error: Some(RelayError::TransientUpstream("flood wait".to_string())),
        ..Script::bytes(payload(10, 0))
    };
    harness.add_object("busy", 3, script);

    let response = send(&harness, Method::GET, "/stream/busy").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "5");
}

#[tokio::test]
async fn test_health_reports_cache_state() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(dir.path(), 1 << 20, 3).await;

    let response = send(&harness, Method::GET, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    let report: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(report["status"], "healthy");
    assert_eq!(report["max_fetches"], 3);
    assert_eq!(report["in_flight"], 0);
    assert_eq!(report["cache_entries"], 0);
    assert_eq!(report["max_cache_bytes"], 1 << 20);
}
