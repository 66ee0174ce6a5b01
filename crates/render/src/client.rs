//! HTTP client for the remote render service.
//!
//! Each item becomes one `POST {base_url}/render` request whose response
//! body is the rendered file. Failures are classified so the worker only
//! spends retry budget on conditions that can clear up by themselves.

use std::time::Duration;

use async_trait::async_trait;
use inkbatch_core::error::ItemError;
use inkbatch_core::types::BatchId;
use inkbatch_pipeline::{RenderedOutput, UnitOfWork, WorkItem};
use reqwest::StatusCode;
use serde::Serialize;

/// Response header carrying the suggested output file name.
pub const FILE_NAME_HEADER: &str = "x-file-name";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Errors from the render service.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The HTTP request itself failed (connect, timeout, body read, etc.).
    #[error("Render request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status code.
    #[error("Render service error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A 2xx response without any content.
    #[error("Render service returned an empty body")]
    EmptyOutput,
}

impl RenderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
            Self::ApiError { status, .. } => StatusCode::from_u16(*status)
                .map(is_transient_status)
                .unwrap_or(false),
            Self::EmptyOutput => false,
        }
    }
}

impl From<RenderError> for ItemError {
    fn from(err: RenderError) -> Self {
        if err.is_transient() {
            ItemError::Transient(err.to_string())
        } else {
            ItemError::Permanent(err.to_string())
        }
    }
}

/// 408, 429 and every 5xx are worth retrying; other failures are not.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    batch_id: BatchId,
    index: usize,
    label: &'a str,
    input: &'a serde_json::Value,
    params: &'a serde_json::Value,
    attempt: u32,
}

/// [`UnitOfWork`] backed by the remote render service.
pub struct RenderClient {
    client: reqwest::Client,
    base_url: String,
}

impl RenderClient {
    /// Create a client for `base_url` (e.g. `http://host:8188`) with a
    /// per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing [`reqwest::Client`]. The client's own timeout is
    /// the only bound on each call.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Render a single item.
    pub async fn render(&self, item: &WorkItem) -> Result<RenderedOutput, RenderError> {
        let body = RenderRequest {
            batch_id: item.batch_id,
            index: item.index,
            label: &item.label,
            input: &item.input,
            params: &item.params,
            attempt: item.attempt,
        };

        let response = self
            .client
            .post(format!("{}/render", self.base_url))
            .json(&body)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let file_name = response
            .headers()
            .get(FILE_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.png", item.label));
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(RenderError::EmptyOutput);
        }

        let mut output = RenderedOutput::new(file_name, bytes);
        if let Some(content_type) = content_type {
            output = output.with_content_type(content_type);
        }
        Ok(output)
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or an
    /// [`RenderError::ApiError`] with a truncated body otherwise.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RenderError> {
        let status = response.status();
        if !status.is_success() {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(RenderError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl UnitOfWork for RenderClient {
    async fn execute(&self, item: &WorkItem) -> Result<RenderedOutput, ItemError> {
        self.render(item).await.map_err(|e| {
            tracing::debug!(
                batch_id = %item.batch_id,
                item_index = item.index,
                attempt = item.attempt,
                error = %e,
                transient = e.is_transient(),
                "Render call failed",
            );
            ItemError::from(e)
        })
    }
}
