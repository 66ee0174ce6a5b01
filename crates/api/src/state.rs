use std::sync::Arc;

use inkbatch_pipeline::BatchEngine;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Batch registry: submission, progress, cancellation and archives.
    pub engine: Arc<BatchEngine>,
    /// Fired when the server starts shutting down; ends open progress
    /// streams so the graceful drain can complete.
    pub shutdown: CancellationToken,
}
