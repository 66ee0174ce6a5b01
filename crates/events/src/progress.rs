//! Progress event envelope.
//!
//! Events are built by the worker and queue, then stamped with a per-batch
//! sequence number by [`ProgressHub::publish`](crate::ProgressHub::publish).

use chrono::Utc;
use inkbatch_core::types::{BatchId, Timestamp};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ProgressKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// The batch was claimed and processing began.
    Processing,
    /// One item resolved (done or failed).
    ItemCompleted,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressKind {
    /// Terminal kinds are emitted exactly once per batch, last.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Status name exposed to transport clients. Item completions are
    /// reported as ongoing processing.
    pub fn wire_status(self) -> &'static str {
        match self {
            Self::Processing | Self::ItemCompleted => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// One observable change to a batch.
///
/// Constructed via [`ProgressEvent::new`] and enriched with the builder
/// methods [`with_counts`](ProgressEvent::with_counts),
/// [`with_item`](ProgressEvent::with_item) and
/// [`with_error`](ProgressEvent::with_error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub batch_id: BatchId,

    pub kind: ProgressKind,

    /// Per-batch sequence number, strictly increasing. Zero until the hub
    /// publishes the event.
    pub sequence: u64,

    /// Items resolved successfully so far.
    pub processed: usize,

    /// Items resolved as failed so far.
    pub failed: usize,

    pub total: usize,

    /// Label of the item this event concerns, if any.
    pub current_item_label: Option<String>,

    pub message: String,

    pub error: Option<String>,

    /// Accumulated output size in bytes.
    pub total_bytes: u64,

    pub timestamp: Timestamp,
}

impl ProgressEvent {
    /// Create an event with zeroed counters and no item or error.
    pub fn new(batch_id: BatchId, kind: ProgressKind, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            kind,
            sequence: 0,
            processed: 0,
            failed: 0,
            total: 0,
            current_item_label: None,
            message: message.into(),
            error: None,
            total_bytes: 0,
            timestamp: Utc::now(),
        }
    }

    /// Set the counters carried by the event.
    pub fn with_counts(mut self, processed: usize, failed: usize, total: usize) -> Self {
        self.processed = processed;
        self.failed = failed;
        self.total = total;
        self
    }

    pub fn with_total_bytes(mut self, total_bytes: u64) -> Self {
        self.total_bytes = total_bytes;
        self
    }

    pub fn with_item(mut self, label: impl Into<String>) -> Self {
        self.current_item_label = Some(label.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use inkbatch_core::types::new_batch_id;

    #[test]
    fn builder_sets_fields() {
        let id = new_batch_id();
        let event = ProgressEvent::new(id, ProgressKind::ItemCompleted, "page 2 done")
            .with_counts(2, 1, 5)
            .with_total_bytes(2048)
            .with_item("page 2")
            .with_error("upstream refused prompt");

        assert_eq!(event.batch_id, id);
        assert_eq!(event.sequence, 0);
        assert_eq!((event.processed, event.failed, event.total), (2, 1, 5));
        assert_eq!(event.total_bytes, 2048);
        assert_eq!(event.current_item_label.as_deref(), Some("page 2"));
        assert_eq!(event.error.as_deref(), Some("upstream refused prompt"));
    }

    #[test]
    fn wire_status_folds_item_completion_into_processing() {
        assert_eq!(ProgressKind::ItemCompleted.wire_status(), "processing");
        assert_eq!(ProgressKind::Processing.wire_status(), "processing");
        assert_eq!(ProgressKind::Cancelled.wire_status(), "cancelled");
    }

    #[test]
    fn only_final_kinds_are_terminal() {
        assert!(!ProgressKind::Processing.is_terminal());
        assert!(!ProgressKind::ItemCompleted.is_terminal());
        assert!(ProgressKind::Completed.is_terminal());
        assert!(ProgressKind::Failed.is_terminal());
        assert!(ProgressKind::Cancelled.is_terminal());
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let event = ProgressEvent::new(new_batch_id(), ProgressKind::Processing, "started")
            .with_item("cover");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "processing");
        assert_eq!(json["currentItemLabel"], "cover");
        assert!(json["batchId"].is_string());
        assert!(json["totalBytes"].is_number());
    }
}
