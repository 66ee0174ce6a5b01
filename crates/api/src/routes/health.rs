use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Batches currently held in memory (not yet evicted).
    pub batches: usize,
    /// Items counted against the in-flight ceiling.
    pub in_flight_items: usize,
    pub max_in_flight_items: usize,
}

/// GET /health -- returns service health and batch engine load.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.engine.store();
    let limits = store.limits();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        batches: store.len(),
        in_flight_items: store.in_flight_items(),
        max_in_flight_items: limits.max_in_flight_items,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
