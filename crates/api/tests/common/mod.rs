#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use inkbatch_api::config::ServerConfig;
use inkbatch_api::router::build_app_router;
use inkbatch_api::state::AppState;
use inkbatch_core::config::BatchConfig;
use inkbatch_core::error::ItemError;
use inkbatch_core::retry::RetryPolicy;
use inkbatch_pipeline::{BatchEngine, EngineHandle, RenderedOutput, UnitOfWork, WorkItem};

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        render_url: "http://127.0.0.1:9".to_string(),
        render_timeout_secs: 1,
    }
}

/// Unit-of-work double: fails items whose label starts with `fail`, pauses
/// items labelled `hold` until [`Fake::release`] is notified.
#[derive(Default)]
pub struct Fake {
    pub holding: Notify,
    pub release: Notify,
}

#[async_trait]
impl UnitOfWork for Fake {
    async fn execute(&self, item: &WorkItem) -> Result<RenderedOutput, ItemError> {
        if item.label.starts_with("fail") {
            return Err(ItemError::permanent(format!("cannot render {}", item.label)));
        }
        if item.label == "hold" {
            self.holding.notify_one();
            self.release.notified().await;
        }
        Ok(RenderedOutput::new(
            format!("{}.png", item.label),
            format!("png:{}", item.index).into_bytes(),
        ))
    }
}

/// A running app: router plus the engine behind it.
pub struct TestApp {
    pub router: Router,
    pub engine: Arc<BatchEngine>,
    pub fake: Arc<Fake>,
    pub shutdown: CancellationToken,
    handle: Option<EngineHandle>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

/// Build the full application router over a started engine.
pub fn build_test_app() -> TestApp {
    build_test_app_with(|config| config)
}

pub fn build_test_app_with(customize: impl FnOnce(BatchConfig) -> BatchConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let batch_config = customize(BatchConfig {
        output_dir: dir.path().to_path_buf(),
        worker_count: 1,
        retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        ..BatchConfig::default()
    });

    let config = test_config();
    let engine = Arc::new(BatchEngine::new(batch_config));
    let fake = Arc::new(Fake::default());
    let handle = engine.start(fake.clone());
    let shutdown = CancellationToken::new();

    let state = AppState {
        config: Arc::new(config.clone()),
        engine: Arc::clone(&engine),
        shutdown: shutdown.clone(),
    };

    TestApp {
        router: build_app_router(state, &config),
        engine,
        fake,
        shutdown,
        handle: Some(handle),
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn post_empty(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Submit a batch with the given labels and return its id.
pub async fn submit(app: Router, labels: &[&str]) -> String {
    let items: Vec<_> = labels
        .iter()
        .map(|label| serde_json::json!({ "label": label, "input": { "prompt": label } }))
        .collect();
    let response = post_json(
        app,
        "/api/v1/batches",
        serde_json::json!({ "items": items, "params": { "size": 512 } }),
    )
    .await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    body_json(response).await["data"]["batchId"]
        .as_str()
        .unwrap()
        .to_string()
}

/// Poll the status endpoint until the batch is terminal.
pub async fn wait_terminal(app: Router, id: &str) -> serde_json::Value {
    for _ in 0..500 {
        let json = body_json(get(app.clone(), &format!("/api/v1/batches/{id}")).await).await;
        let status = json["data"]["status"].as_str().unwrap_or_default().to_string();
        if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
            return json["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {id} never reached a terminal state");
}
