use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use inkbatch_api::config::ServerConfig;
use inkbatch_api::router::build_app_router;
use inkbatch_api::state::AppState;
use inkbatch_core::config::BatchConfig;
use inkbatch_pipeline::BatchEngine;
use inkbatch_render::RenderClient;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let batch_config = BatchConfig::from_env().expect("Invalid batch configuration");
    tracing::info!(
        host = %config.host,
        port = %config.port,
        render_url = %config.render_url,
        workers = batch_config.worker_count,
        max_items = batch_config.max_items_per_batch,
        max_in_flight_items = batch_config.max_in_flight_items,
        "Loaded configuration",
    );

    std::fs::create_dir_all(&batch_config.output_dir)
        .expect("Failed to create batch output directory");

    // --- Render client ---
    let render = RenderClient::new(
        config.render_url.clone(),
        Duration::from_secs(config.render_timeout_secs),
    )
    .expect("Failed to build render client");

    // --- Batch engine ---
    let engine = Arc::new(BatchEngine::new(batch_config));
    let engine_handle = engine.start(Arc::new(render));

    // --- App state ---
    let shutdown = CancellationToken::new();
    let state = AppState {
        config: Arc::new(config.clone()),
        engine: Arc::clone(&engine),
        shutdown: shutdown.clone(),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Progress streams would otherwise hold the drain open.
            shutdown.cancel();
        })
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping batch engine");

    let timeout = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(timeout, engine_handle.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Batch engine did not stop in time, abandoning in-flight work",
        );
    }

    tracing::info!("Graceful shutdown complete");
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` controls filtering; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "inkbatch_api=debug,inkbatch_pipeline=debug,inkbatch_render=debug,tower_http=debug".into()
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
