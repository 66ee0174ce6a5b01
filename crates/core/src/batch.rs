//! Batch and item records, their status state machines, and the counter
//! bookkeeping shared by the store and the archive manifest.
//!
//! Everything here is pure: callers own the locking and the clock.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{BatchId, Timestamp};

/// Maximum length of an item label.
const MAX_LABEL_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Batch status
// ---------------------------------------------------------------------------

/// Lifecycle status of a batch.
///
/// `Pending -> Processing -> {Completed, Failed, Cancelled}`; a pending batch
/// may also go straight to `Cancelled` when it is cancelled before pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal batches never change status again and are eligible for
    /// eviction once their retention window has elapsed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::Validation(format!(
                "Unknown batch status: '{other}'. Valid statuses: pending, processing, completed, failed, cancelled"
            ))),
        }
    }
}

/// Terminal status for a batch whose items have all been resolved.
///
/// Only a total wipeout is `Failed`; partial failure is reported as
/// `Completed` with a non-zero failed count.
pub fn final_status(processed: usize, failed: usize, total: usize) -> BatchStatus {
    debug_assert!(processed + failed <= total);
    if total > 0 && failed == total {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Item state
// ---------------------------------------------------------------------------

/// Lifecycle state of a single item. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl ItemState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Done | Self::Failed => 2,
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_transition_to(self, next: ItemState) -> bool {
        next.rank() > self.rank()
    }
}

// ---------------------------------------------------------------------------
// Submission shape
// ---------------------------------------------------------------------------

/// One item as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSpec {
    /// Human-readable label shown in progress events. Defaults to
    /// `item-<n>` when empty.
    #[serde(default)]
    pub label: String,
    /// Opaque input handed to the unit-of-work.
    #[serde(default)]
    pub input: serde_json::Value,
}

/// A batch as submitted: ordered items plus unit-of-work parameters shared
/// by all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSpec {
    pub items: Vec<ItemSpec>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Admission guard applied before any resources are allocated.
pub fn validate_spec(spec: &BatchSpec, max_items: usize) -> Result<(), CoreError> {
    if spec.items.is_empty() {
        return Err(CoreError::Validation(
            "A batch must contain at least one item".to_string(),
        ));
    }
    if spec.items.len() > max_items {
        return Err(CoreError::Validation(format!(
            "A batch may contain at most {max_items} items (got {})",
            spec.items.len()
        )));
    }
    for (i, item) in spec.items.iter().enumerate() {
        if item.label.chars().count() > MAX_LABEL_LEN {
            return Err(CoreError::Validation(format!(
                "Label of item {i} exceeds {MAX_LABEL_LEN} characters"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Item records
// ---------------------------------------------------------------------------

/// Reference to a stored item output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRef {
    /// Name of the stored file, also used as the archive entry name.
    pub file_name: String,
    /// Location on disk. Internal; never serialized to clients.
    #[serde(skip_serializing)]
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// How an item was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Done { output: OutputRef, attempts: u32 },
    Failed { error: String, attempts: u32 },
}

impl ItemResult {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub index: usize,
    pub label: String,
    pub input: serde_json::Value,
    pub state: ItemState,
    pub output: Option<OutputRef>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Batch record
// ---------------------------------------------------------------------------

/// Full batch record as held by the store.
///
/// Counters obey `processed_count + failed_count <= total_count`, with
/// equality once the batch is `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub items: Vec<Item>,
    pub params: serde_json::Value,
    pub status: BatchStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub total_count: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    pub total_bytes: u64,
    pub cancel_requested: bool,
}

/// Outcome of applying an item transition to a batch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The item moved forward.
    Changed,
    /// The item was already at or past the requested state.
    Unchanged,
}

impl Batch {
    /// Build a pending record from a validated spec. Item order is kept
    /// verbatim.
    pub fn new(id: BatchId, spec: BatchSpec, now: Timestamp) -> Self {
        let items: Vec<Item> = spec
            .items
            .into_iter()
            .enumerate()
            .map(|(index, item)| Item {
                index,
                label: if item.label.trim().is_empty() {
                    format!("item-{}", index + 1)
                } else {
                    item.label
                },
                input: item.input,
                state: ItemState::Pending,
                output: None,
                error: None,
                attempts: 0,
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self {
            id,
            total_count: items.len(),
            items,
            params: spec.params,
            status: BatchStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: None,
            processed_count: 0,
            failed_count: 0,
            total_bytes: 0,
            cancel_requested: false,
        }
    }

    pub fn resolved_count(&self) -> usize {
        self.processed_count + self.failed_count
    }

    /// Items never resolved (left pending by cancellation).
    pub fn skipped_count(&self) -> usize {
        self.total_count - self.resolved_count()
    }

    pub fn item(&self, index: usize) -> Result<&Item, CoreError> {
        self.items.get(index).ok_or_else(|| {
            CoreError::Validation(format!(
                "Item index {index} out of range for batch {} ({} items)",
                self.id, self.total_count
            ))
        })
    }

    fn item_mut(&mut self, index: usize) -> Result<&mut Item, CoreError> {
        let (id, total) = (self.id, self.total_count);
        self.items.get_mut(index).ok_or_else(|| {
            CoreError::Validation(format!(
                "Item index {index} out of range for batch {id} ({total} items)"
            ))
        })
    }

    /// Move an item from Pending to Processing.
    pub fn start_item(&mut self, index: usize, now: Timestamp) -> Result<Applied, CoreError> {
        let item = self.item_mut(index)?;
        if !item.state.can_transition_to(ItemState::Processing) {
            return Ok(Applied::Unchanged);
        }
        item.state = ItemState::Processing;
        item.started_at = Some(now);
        Ok(Applied::Changed)
    }

    /// Resolve an item and bump the matching counter.
    ///
    /// Resolving an already-resolved item is `Unchanged`, never an error, so
    /// duplicate deliveries cannot double count.
    pub fn resolve_item(
        &mut self,
        index: usize,
        result: ItemResult,
        now: Timestamp,
    ) -> Result<Applied, CoreError> {
        let item = self.item_mut(index)?;
        if item.state.is_resolved() {
            return Ok(Applied::Unchanged);
        }

        let added_bytes = match result {
            ItemResult::Done { output, attempts } => {
                let size = output.size_bytes;
                item.state = ItemState::Done;
                item.output = Some(output);
                item.attempts = attempts;
                size
            }
            ItemResult::Failed { error, attempts } => {
                item.state = ItemState::Failed;
                item.error = Some(error);
                item.attempts = attempts;
                0
            }
        };
        item.finished_at = Some(now);
        let done = item.state == ItemState::Done;

        if done {
            self.processed_count += 1;
            self.total_bytes += added_bytes;
        } else {
            self.failed_count += 1;
        }
        debug_assert!(self.resolved_count() <= self.total_count);
        Ok(Applied::Changed)
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            id: self.id,
            status: self.status,
            total_items: self.total_count,
            processed: self.processed_count,
            failed: self.failed_count,
            created_at: self.created_at,
        }
    }
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: BatchId,
    pub status: BatchStatus,
    pub total_items: usize,
    pub processed: usize,
    pub failed: usize,
    pub created_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
