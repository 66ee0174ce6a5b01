//! Batch worker loop.
//!
//! A worker pulls one batch at a time from the [`BatchQueue`], claims it in
//! the [`BatchStore`] and drives its items, in submission order, through the
//! injected [`UnitOfWork`]. Several workers may share one queue; the store's
//! claim guarantees a batch is only ever processed by one of them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use inkbatch_core::batch::{final_status, Batch, BatchStatus, Item, ItemResult, OutputRef};
use inkbatch_core::error::{CoreError, ItemError};
use inkbatch_core::retry::{RetryDecision, RetryPolicy};
use inkbatch_core::types::BatchId;
use inkbatch_events::{ProgressEvent, ProgressHub, ProgressKind};
use tokio_util::sync::CancellationToken;

use crate::outputs::OutputStore;
use crate::queue::BatchQueue;
use crate::store::{BatchStore, RecordOutcome};
use crate::unit_of_work::{UnitOfWork, WorkItem};

/// How a claimed batch left the item loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRun {
    Finalized(BatchStatus),
    /// The worker was asked to stop; the batch stays `Processing`.
    Interrupted,
    /// Another worker owns the batch (or it was cancelled while queued).
    Skipped,
}

#[derive(Clone)]
pub struct Worker {
    id: usize,
    queue: Arc<BatchQueue>,
    store: Arc<BatchStore>,
    hub: Arc<ProgressHub>,
    outputs: Arc<OutputStore>,
    unit: Arc<dyn UnitOfWork>,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<BatchQueue>,
        store: Arc<BatchStore>,
        hub: Arc<ProgressHub>,
        outputs: Arc<OutputStore>,
        unit: Arc<dyn UnitOfWork>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            hub,
            outputs,
            unit,
            retry,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process batches until `shutdown` fires or the queue is shut down.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker_id = self.id, "Batch worker started");

        loop {
            let batch_id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            if let Err(e) = self.process_batch(batch_id, &shutdown).await {
                tracing::error!(
                    worker_id = self.id,
                    batch_id = %batch_id,
                    error = %e,
                    "Batch processing aborted",
                );
            }
        }

        tracing::info!(worker_id = self.id, "Batch worker stopped");
    }

    /// Claim one batch and run it to a terminal state.
    pub async fn process_batch(
        &self,
        batch_id: BatchId,
        shutdown: &CancellationToken,
    ) -> Result<BatchRun, CoreError> {
        let claimed = match self.store.claim_for_processing(batch_id) {
            Ok(claimed) => claimed,
            Err(CoreError::AlreadyClaimed(_)) => {
                tracing::debug!(
                    worker_id = self.id,
                    batch_id = %batch_id,
                    "Batch no longer pending, skipping",
                );
                return Ok(BatchRun::Skipped);
            }
            Err(e) => return Err(e),
        };
        let batch = claimed.batch;

        tracing::info!(
            worker_id = self.id,
            batch_id = %batch_id,
            items = batch.total_count,
            "Batch claimed",
        );
        self.hub.publish(
            batch_id,
            ProgressEvent::new(
                batch_id,
                ProgressKind::Processing,
                format!("Processing {} items", batch.total_count),
            )
            .with_counts(0, 0, batch.total_count),
        );

        let mut cancelled = false;
        for item in &batch.items {
            if claimed.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if shutdown.is_cancelled() {
                tracing::warn!(
                    worker_id = self.id,
                    batch_id = %batch_id,
                    item_index = item.index,
                    "Worker stopping mid-batch, batch left processing",
                );
                return Ok(BatchRun::Interrupted);
            }

            self.store.mark_item_processing(batch_id, item.index)?;
            let result = self.run_item(&batch, item).await;
            let error = match &result {
                ItemResult::Failed { error, .. } => Some(error.clone()),
                ItemResult::Done { .. } => None,
            };

            if let RecordOutcome::Recorded(counters) =
                self.store.record_item_result(batch_id, item.index, result)?
            {
                let message = match error {
                    Some(_) => format!("Item '{}' failed", item.label),
                    None => format!("Item '{}' completed", item.label),
                };
                let mut event = ProgressEvent::new(batch_id, ProgressKind::ItemCompleted, message)
                    .with_counts(counters.processed, counters.failed, counters.total)
                    .with_total_bytes(counters.total_bytes)
                    .with_item(item.label.clone());
                if let Some(error) = error {
                    event = event.with_error(error);
                }
                self.hub.publish(batch_id, event);
            }
        }

        let status = if cancelled {
            BatchStatus::Cancelled
        } else {
            self.store.inspect(batch_id, |b| {
                final_status(b.processed_count, b.failed_count, b.total_count)
            })?
        };
        let finalized = self.store.finalize(batch_id, status)?;
        self.publish_terminal(&finalized);
        self.hub.close_batch(batch_id);

        Ok(BatchRun::Finalized(finalized.status))
    }

    fn publish_terminal(&self, batch: &Batch) {
        let (kind, message) = match batch.status {
            BatchStatus::Cancelled => (
                ProgressKind::Cancelled,
                format!(
                    "Batch cancelled after {} of {} items",
                    batch.resolved_count(),
                    batch.total_count
                ),
            ),
            BatchStatus::Failed => (
                ProgressKind::Failed,
                format!("All {} items failed", batch.total_count),
            ),
            _ if batch.failed_count > 0 => (
                ProgressKind::Completed,
                format!(
                    "Batch completed: {} succeeded, {} failed",
                    batch.processed_count, batch.failed_count
                ),
            ),
            _ => (
                ProgressKind::Completed,
                format!("Batch completed: {} items", batch.processed_count),
            ),
        };

        let mut event = ProgressEvent::new(batch.id, kind, message)
            .with_counts(batch.processed_count, batch.failed_count, batch.total_count)
            .with_total_bytes(batch.total_bytes);
        if kind == ProgressKind::Failed {
            let last_error = batch
                .items
                .iter()
                .rev()
                .find_map(|item| item.error.clone())
                .unwrap_or_else(|| "All items failed".to_string());
            event = event.with_error(last_error);
        }
        self.hub.publish(batch.id, event);
    }

    /// Run one item through the unit-of-work with the retry policy applied.
    /// Never fails: exhausted retries resolve the item as `Failed`.
    async fn run_item(&self, batch: &Batch, item: &Item) -> ItemResult {
        let mut attempt = 1;
        loop {
            let work = WorkItem {
                batch_id: batch.id,
                index: item.index,
                label: item.label.clone(),
                input: item.input.clone(),
                params: batch.params.clone(),
                attempt,
            };

            let error = match self.attempt(&work).await {
                Ok(output) => {
                    return ItemResult::Done {
                        output,
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            match self.retry.decide(attempt, &error) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        worker_id = self.id,
                        batch_id = %batch.id,
                        item_index = item.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Item attempt failed, retry scheduled",
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        worker_id = self.id,
                        batch_id = %batch.id,
                        item_index = item.index,
                        attempt,
                        error = %error,
                        "Item failed",
                    );
                    return ItemResult::Failed {
                        error: error.to_string(),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// One unit-of-work call plus output storage. A panic inside the unit
    /// of work fails the item permanently instead of killing the worker.
    async fn attempt(&self, work: &WorkItem) -> Result<OutputRef, ItemError> {
        let rendered = AssertUnwindSafe(self.unit.execute(work))
            .catch_unwind()
            .await
            .map_err(|payload| {
                let reason = panic_message(payload.as_ref());
                tracing::error!(
                    worker_id = self.id,
                    batch_id = %work.batch_id,
                    item_index = work.index,
                    panic = %reason,
                    "Unit of work panicked",
                );
                ItemError::permanent(format!("unit of work panicked: {reason}"))
            })??;
        self.outputs
            .write(work.batch_id, work.index, &rendered)
            .await
            .map_err(|e| ItemError::transient(format!("Failed to store output: {e}")))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
