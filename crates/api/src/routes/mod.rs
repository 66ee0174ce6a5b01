pub mod batches;
pub mod health;

use std::time::Duration;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /batches                         list, submit
/// /batches/{id}                    status
/// /batches/{id}/cancel             cancel (POST)
/// /batches/{id}/events             progress stream (SSE)
/// /batches/{id}/archive            ZIP download
/// ```
pub fn api_routes(request_timeout: Duration) -> Router<AppState> {
    Router::new().nest("/batches", batches::router(request_timeout))
}
