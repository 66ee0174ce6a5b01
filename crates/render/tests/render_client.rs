//! RenderClient against an in-process stub service.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use inkbatch_core::types::BatchId;
use inkbatch_pipeline::{UnitOfWork, WorkItem};
use inkbatch_render::RenderClient;

#[derive(Clone, Default)]
struct Stub {
    calls: Arc<AtomicU32>,
}

/// Behaviour is picked from the item label so one stub serves every test.
async fn render(
    State(stub): State<Stub>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    let label = body["label"].as_str().unwrap_or_default().to_string();
    let mut headers = HeaderMap::new();

    match label.as_str() {
        "named" => {
            headers.insert("x-file-name", "cover.webp".parse().unwrap());
            headers.insert("content-type", "image/webp".parse().unwrap());
            (StatusCode::OK, headers, b"webp-bytes".to_vec())
        }
        "busy" => (StatusCode::SERVICE_UNAVAILABLE, headers, b"overloaded".to_vec()),
        "throttled" => (StatusCode::TOO_MANY_REQUESTS, headers, Vec::new()),
        "invalid" => (StatusCode::BAD_REQUEST, headers, b"missing prompt".to_vec()),
        "empty" => (StatusCode::OK, headers, Vec::new()),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            (StatusCode::OK, headers, b"late".to_vec())
        }
        _ => {
            let echo = format!("{}:{}", body["index"], body["attempt"]);
            (StatusCode::OK, headers, echo.into_bytes())
        }
    }
}

async fn spawn_stub() -> (String, Stub) {
    let stub = Stub::default();
    let app = Router::new()
        .route("/render", post(render))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), stub)
}

fn item(label: &str) -> WorkItem {
    WorkItem {
        batch_id: BatchId::nil(),
        index: 4,
        label: label.to_string(),
        input: serde_json::json!({ "prompt": "a fox" }),
        params: serde_json::Value::Null,
        attempt: 2,
    }
}

#[tokio::test]
async fn success_uses_header_file_name_and_content_type() {
    let (url, _) = spawn_stub().await;
    let client = RenderClient::new(url, Duration::from_secs(5)).unwrap();

    let output = client.execute(&item("named")).await.unwrap();
    assert_eq!(output.file_name, "cover.webp");
    assert_eq!(output.content_type.as_deref(), Some("image/webp"));
    assert_eq!(&output.bytes[..], b"webp-bytes");
}

#[tokio::test]
async fn success_without_header_falls_back_to_label() {
    let (url, stub) = spawn_stub().await;
    let client = RenderClient::new(url, Duration::from_secs(5)).unwrap();

    let output = client.execute(&item("page-1")).await.unwrap();
    assert_eq!(output.file_name, "page-1.png");
    // The request body carries the item index and attempt.
    assert_eq!(&output.bytes[..], b"4:2");
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_errors_and_throttling_are_transient() {
    let (url, _) = spawn_stub().await;
    let client = RenderClient::new(url, Duration::from_secs(5)).unwrap();

    assert!(client.execute(&item("busy")).await.unwrap_err().is_transient());
    assert!(client
        .execute(&item("throttled"))
        .await
        .unwrap_err()
        .is_transient());
}

#[tokio::test]
async fn client_errors_and_empty_bodies_are_permanent() {
    let (url, _) = spawn_stub().await;
    let client = RenderClient::new(url, Duration::from_secs(5)).unwrap();

    let err = client.execute(&item("invalid")).await.unwrap_err();
    assert!(!err.is_transient());
    assert!(err.message().contains("missing prompt"));

    assert!(!client.execute(&item("empty")).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn timeout_is_transient() {
    let (url, _) = spawn_stub().await;
    let client = RenderClient::new(url, Duration::from_millis(100)).unwrap();

    assert!(client.execute(&item("slow")).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn unreachable_service_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RenderClient::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
    assert!(client.execute(&item("page-1")).await.unwrap_err().is_transient());
}
