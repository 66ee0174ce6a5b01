//! Handlers for the `/batches` resource.
//!
//! Thin adapters over [`BatchEngine`](inkbatch_pipeline::BatchEngine): each
//! handler validates its input, calls one engine operation and wraps the
//! result in the standard envelope. The progress stream and the archive
//! download are streamed straight from the engine.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use inkbatch_core::batch::{BatchSpec, BatchStatus, ItemSpec};
use inkbatch_core::types::BatchId;
use inkbatch_events::ProgressEvent;
use inkbatch_pipeline::{BatchEngine, CancelOutcome};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SubmitItem {
    #[serde(default)]
    #[validate(length(max = 200))]
    pub label: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Body of `POST /batches`.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitBatchRequest {
    #[validate(length(min = 1), nested)]
    pub items: Vec<SubmitItem>,
    /// Parameters shared by every item.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl From<SubmitBatchRequest> for BatchSpec {
    fn from(req: SubmitBatchRequest) -> Self {
        BatchSpec {
            items: req
                .items
                .into_iter()
                .map(|item| ItemSpec {
                    label: item.label,
                    input: item.input,
                })
                .collect(),
            params: req.params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListBatchesQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub batch_id: BatchId,
    /// `cancel_requested`, `cancelled` or `already_terminal`.
    pub outcome: &'static str,
    pub status: BatchStatus,
}

/// Data payload of one SSE frame.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressPayload<'a> {
    #[serde(flatten)]
    event: &'a ProgressEvent,
    /// Wire status (`processing`, `completed`, `failed`, `cancelled`).
    status: &'static str,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/batches
///
/// Admit a batch. Returns 201 with `{ batchId, status: "pending", totalItems }`.
/// Over-capacity submissions are refused with 429 rather than queued.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(input): Json<SubmitBatchRequest>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;
    let receipt = state.engine.submit(input.into())?;

    tracing::info!(
        batch_id = %receipt.batch_id,
        items = receipt.total_items,
        "Batch submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: receipt })))
}

// ---------------------------------------------------------------------------
// List / get
// ---------------------------------------------------------------------------

/// GET /api/v1/batches
///
/// List non-evicted batches, oldest first. Supports an optional `status`
/// filter (`pending`, `processing`, `completed`, `failed`, `cancelled`).
pub async fn list_batches(
    State(state): State<AppState>,
    Query(params): Query<ListBatchesQuery>,
) -> AppResult<impl IntoResponse> {
    let status = params
        .status
        .as_deref()
        .map(BatchStatus::from_str)
        .transpose()?;

    Ok(Json(DataResponse {
        data: state.engine.list(status),
    }))
}

/// GET /api/v1/batches/{id}
///
/// Point-in-time status, including the last progress event.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<impl IntoResponse> {
    let view = state.engine.status(batch_id)?;
    Ok(Json(DataResponse { data: view }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/batches/{id}/cancel
///
/// Idempotent: cancelling a terminal batch succeeds without changing it.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.engine.cancel(batch_id)?;
    let (outcome, status) = match outcome {
        CancelOutcome::Requested(status) => ("cancel_requested", status),
        CancelOutcome::CancelledBeforeStart => ("cancelled", BatchStatus::Cancelled),
        CancelOutcome::AlreadyTerminal(status) => ("already_terminal", status),
    };

    tracing::info!(batch_id = %batch_id, outcome, "Batch cancel handled");

    Ok(Json(DataResponse {
        data: CancelResponse {
            batch_id,
            outcome,
            status,
        },
    }))
}

// ---------------------------------------------------------------------------
// Progress stream
// ---------------------------------------------------------------------------

/// Unregisters the subscriber when the SSE stream is dropped (client gone).
struct SubscriberGuard {
    engine: Arc<BatchEngine>,
    batch_id: BatchId,
    subscriber_id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.engine.unsubscribe(self.batch_id, self.subscriber_id);
    }
}

/// GET /api/v1/batches/{id}/events
///
/// Server-sent events: buffered history first, then live events. The
/// `event:` field is the wire status and `id:` the per-batch sequence
/// number. The stream ends after the terminal event.
pub async fn batch_events(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.engine.subscribe(batch_id)?;
    let guard = SubscriberGuard {
        engine: Arc::clone(&state.engine),
        batch_id,
        subscriber_id: subscription.id,
    };
    let (replay, live) = subscription.into_parts();

    tracing::debug!(
        batch_id = %batch_id,
        replayed = replay.len(),
        "Progress stream opened",
    );

    let stream = futures::stream::iter(replay)
        .chain(ReceiverStream::new(live))
        .filter_map(move |event| {
            let _guard = &guard;
            let frame = to_sse_event(&event);
            async move { frame }
        })
        .map(Ok)
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &ProgressEvent) -> Option<Event> {
    let payload = ProgressPayload {
        event,
        status: event.kind.wire_status(),
    };
    match Event::default()
        .event(event.kind.wire_status())
        .id(event.sequence.to_string())
        .json_data(&payload)
    {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(
                batch_id = %event.batch_id,
                sequence = event.sequence,
                error = %e,
                "Failed to encode progress event",
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// GET /api/v1/batches/{id}/archive
///
/// Stream the ZIP archive of a terminal batch. Returns 409 `NOT_READY`
/// while the batch is still pending or processing.
pub async fn download_archive(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<Response> {
    let archive = state.engine.archive(batch_id)?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", archive.file_name),
        )
        .body(Body::from_stream(archive.stream))
        .map_err(|e| AppError::InternalError(format!("Failed to build archive response: {e}")))
}
