//! Concurrent registry of batch records.
//!
//! The map lock is only held to look up, insert or evict a record; every
//! state transition happens under the record's own mutex, so unrelated
//! batches never contend. A record lock is never held while the map lock
//! is acquired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use inkbatch_core::batch::{
    validate_spec, Applied, Batch, BatchSpec, BatchStatus, BatchSummary, ItemResult,
};
use inkbatch_core::config::BatchConfig;
use inkbatch_core::error::CoreError;
use inkbatch_core::types::{new_batch_id, BatchId, Timestamp};
use tokio_util::sync::CancellationToken;

/// Upper bound on the retention window, so expiry arithmetic cannot
/// overflow.
const MAX_RETENTION_DAYS: i64 = 36_500;

/// Admission and retention limits enforced by the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_items_per_batch: usize,
    pub max_in_flight_items: usize,
    pub retention: Duration,
}

impl From<&BatchConfig> for StoreLimits {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_items_per_batch: config.max_items_per_batch,
            max_in_flight_items: config.max_in_flight_items,
            retention: config.retention,
        }
    }
}

/// A batch exclusively claimed by one worker.
#[derive(Debug)]
pub struct ClaimedBatch {
    /// Snapshot taken at claim time.
    pub batch: Batch,
    /// Fires when cancellation is requested; checked at item boundaries.
    pub cancel: CancellationToken,
}

/// Counters after an item result was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(Counters),
    /// The item had already been resolved; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancellation flag set (or already set); the batch had this status.
    Requested(BatchStatus),
    /// The batch never started and is now `Cancelled`.
    CancelledBeforeStart,
    /// Nothing to do: the batch already reached this terminal status.
    AlreadyTerminal(BatchStatus),
}

struct BatchRecord {
    batch: Mutex<Batch>,
    cancel: CancellationToken,
}

impl BatchRecord {
    fn lock(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of batch records keyed by id; owns TTL-based eviction.
///
/// Designed to be shared via `Arc<BatchStore>`.
pub struct BatchStore {
    records: RwLock<HashMap<BatchId, Arc<BatchRecord>>>,
    /// Items belonging to non-terminal batches.
    in_flight_items: AtomicUsize,
    limits: StoreLimits,
}

impl BatchStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            in_flight_items: AtomicUsize::new(0),
            limits,
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    fn record(&self, id: BatchId) -> Result<Arc<BatchRecord>, CoreError> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound(id))
    }

    /// Reserve `n` in-flight slots, refusing rather than queueing when the
    /// ceiling would be crossed.
    fn reserve(&self, n: usize) -> Result<(), CoreError> {
        let ceiling = self.limits.max_in_flight_items;
        self.in_flight_items
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(n).filter(|next| *next <= ceiling)
            })
            .map(|_| ())
            .map_err(|in_flight| CoreError::CapacityExceeded {
                requested: n,
                in_flight,
                ceiling,
            })
    }

    fn release(&self, n: usize) {
        // The closure always returns Some, so this cannot fail.
        let _ = self
            .in_flight_items
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            });
    }

    /// Admit a new batch in `Pending` state.
    ///
    /// Fails with `Validation` for an empty or oversized batch and with
    /// `CapacityExceeded` when the in-flight item ceiling would be crossed.
    /// No record exists after a failure.
    pub fn create(&self, spec: BatchSpec) -> Result<BatchId, CoreError> {
        validate_spec(&spec, self.limits.max_items_per_batch)?;
        let item_count = spec.items.len();
        self.reserve(item_count)?;

        let id = new_batch_id();
        let record = BatchRecord {
            batch: Mutex::new(Batch::new(id, spec, Utc::now())),
            cancel: CancellationToken::new(),
        };
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(record));

        tracing::info!(batch_id = %id, items = item_count, "Batch admitted");
        Ok(id)
    }

    /// Snapshot of a batch record.
    pub fn get(&self, id: BatchId) -> Result<Batch, CoreError> {
        Ok(self.record(id)?.lock().clone())
    }

    /// Run `f` against the record without cloning it.
    pub fn inspect<T>(&self, id: BatchId, f: impl FnOnce(&Batch) -> T) -> Result<T, CoreError> {
        let record = self.record(id)?;
        let batch = record.lock();
        Ok(f(&batch))
    }

    pub fn contains(&self, id: BatchId) -> bool {
        self.record(id).is_ok()
    }

    /// Atomically move a batch from `Pending` to `Processing` and hand it to
    /// the caller. Any other status means someone else got there first.
    pub fn claim_for_processing(&self, id: BatchId) -> Result<ClaimedBatch, CoreError> {
        let record = self.record(id)?;
        let mut batch = record.lock();

        if batch.status != BatchStatus::Pending {
            return Err(CoreError::AlreadyClaimed(id));
        }
        batch.status = BatchStatus::Processing;
        batch.started_at = Some(Utc::now());

        Ok(ClaimedBatch {
            batch: batch.clone(),
            cancel: record.cancel.clone(),
        })
    }

    /// Mark an item as in progress.
    pub fn mark_item_processing(&self, id: BatchId, index: usize) -> Result<(), CoreError> {
        let record = self.record(id)?;
        let mut batch = record.lock();
        batch.start_item(index, Utc::now())?;
        Ok(())
    }

    /// Resolve an item and bump the batch counters.
    ///
    /// Idempotent per item: a second result for a resolved item (or any
    /// result after the batch went terminal) is logged and ignored.
    pub fn record_item_result(
        &self,
        id: BatchId,
        index: usize,
        result: ItemResult,
    ) -> Result<RecordOutcome, CoreError> {
        let record = self.record(id)?;
        let mut batch = record.lock();

        if batch.status.is_terminal() {
            tracing::warn!(
                batch_id = %id,
                item_index = index,
                status = %batch.status,
                "Item result arrived after batch was finalized, ignoring",
            );
            return Ok(RecordOutcome::Duplicate);
        }

        match batch.resolve_item(index, result, Utc::now())? {
            Applied::Changed => Ok(RecordOutcome::Recorded(Counters {
                processed: batch.processed_count,
                failed: batch.failed_count,
                total: batch.total_count,
                total_bytes: batch.total_bytes,
            })),
            Applied::Unchanged => {
                tracing::warn!(
                    batch_id = %id,
                    item_index = index,
                    "Duplicate item result ignored",
                );
                Ok(RecordOutcome::Duplicate)
            }
        }
    }

    /// Move a batch to a terminal status and start its retention clock.
    ///
    /// Finalizing an already-terminal batch returns it unchanged.
    /// `Completed` and `Failed` require every item to be resolved.
    pub fn finalize(&self, id: BatchId, status: BatchStatus) -> Result<Batch, CoreError> {
        if !status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "Cannot finalize batch {id} with non-terminal status {status}"
            )));
        }

        let record = self.record(id)?;
        let mut batch = record.lock();

        if batch.status.is_terminal() {
            return Ok(batch.clone());
        }
        if status != BatchStatus::Cancelled && batch.resolved_count() != batch.total_count {
            return Err(CoreError::Internal(format!(
                "Batch {id} cannot be {status}: {} of {} items resolved",
                batch.resolved_count(),
                batch.total_count
            )));
        }

        let now = Utc::now();
        batch.status = status;
        batch.completed_at = Some(now);
        batch.expires_at = Some(now + self.retention());
        let snapshot = batch.clone();
        drop(batch);

        self.release(snapshot.total_count);

        tracing::info!(
            batch_id = %id,
            status = %status,
            processed = snapshot.processed_count,
            failed = snapshot.failed_count,
            skipped = snapshot.skipped_count(),
            "Batch finalized",
        );
        Ok(snapshot)
    }

    fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.limits.retention)
            .unwrap_or_else(|_| chrono::Duration::days(MAX_RETENTION_DAYS))
            .min(chrono::Duration::days(MAX_RETENTION_DAYS))
    }

    /// Request cooperative cancellation.
    ///
    /// The worker honours the request at its next item boundary. Cancelling
    /// a terminal batch is a no-op.
    pub fn cancel(&self, id: BatchId) -> Result<CancelOutcome, CoreError> {
        let record = self.record(id)?;
        let mut batch = record.lock();

        if batch.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(batch.status));
        }
        if !batch.cancel_requested {
            batch.cancel_requested = true;
            record.cancel.cancel();
            tracing::info!(batch_id = %id, status = %batch.status, "Batch cancellation requested");
        }
        Ok(CancelOutcome::Requested(batch.status))
    }

    /// Evict every terminal batch whose `expires_at <= now`.
    ///
    /// Only `finalize` sets `expires_at`, so a batch still being processed is
    /// never evicted.
    pub fn sweep(&self, now: Timestamp) -> Vec<BatchId> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);

        let expired: Vec<BatchId> = records
            .iter()
            .filter(|(_, record)| {
                let batch = record.lock();
                let expired =
                    batch.status.is_terminal() && batch.expires_at.is_some_and(|at| at <= now);
                expired
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            records.remove(id);
        }
        expired
    }

    /// Summaries of all non-evicted batches, oldest first.
    pub fn list(&self, status: Option<BatchStatus>) -> Vec<BatchSummary> {
        let records: Vec<Arc<BatchRecord>> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut summaries: Vec<BatchSummary> = records
            .iter()
            .map(|record| record.lock().summary())
            .filter(|summary| status.map_or(true, |s| summary.status == s))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently counted against the in-flight ceiling.
    pub fn in_flight_items(&self) -> usize {
        self.in_flight_items.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
