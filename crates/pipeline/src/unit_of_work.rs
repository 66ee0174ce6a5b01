//! The pluggable per-item operation a worker drives.

use async_trait::async_trait;
use bytes::Bytes;
use inkbatch_core::error::ItemError;
use inkbatch_core::types::BatchId;

/// Everything a unit-of-work needs to produce one item's output.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub batch_id: BatchId,
    pub index: usize,
    pub label: String,
    pub input: serde_json::Value,
    /// Parameters shared by every item in the batch.
    pub params: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Output produced for one item, before it is written to the output store.
#[derive(Debug, Clone)]
pub struct RenderedOutput {
    /// Suggested file name; sanitized by the output store.
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl RenderedOutput {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Produces the output for a single item.
///
/// Implementations must bound their own execution time and report a
/// timeout as [`ItemError::Transient`]; the worker adds no timeout of its
/// own. Failures that can never succeed must be [`ItemError::Permanent`] so
/// no retry budget is wasted on them.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<RenderedOutput, ItemError>;
}
