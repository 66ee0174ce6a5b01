//! Route definitions for the `/batches` resource.

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::batches;
use crate::state::AppState;

/// Routes mounted at `/batches`.
///
/// ```text
/// GET    /                -> list_batches
/// POST   /                -> submit_batch
/// GET    /{id}            -> get_batch
/// POST   /{id}/cancel     -> cancel_batch
/// GET    /{id}/events     -> batch_events      (SSE, no request timeout)
/// GET    /{id}/archive    -> download_archive  (stream, no request timeout)
/// ```
pub fn router(request_timeout: Duration) -> Router<AppState> {
    Router::new()
        .route("/", get(batches::list_batches).post(batches::submit_batch))
        .route("/{id}", get(batches::get_batch))
        .route("/{id}/cancel", post(batches::cancel_batch))
        // Only the routes registered above are time-limited.
        .route_layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .route("/{id}/events", get(batches::batch_events))
        .route("/{id}/archive", get(batches::download_archive))
}
