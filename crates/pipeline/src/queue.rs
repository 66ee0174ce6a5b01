//! FIFO admission queue between submission and the worker pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use inkbatch_core::batch::{BatchSpec, BatchStatus};
use inkbatch_core::error::CoreError;
use inkbatch_core::types::BatchId;
use inkbatch_events::{ProgressEvent, ProgressHub, ProgressKind};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::store::{BatchStore, CancelOutcome};

/// What a caller gets back from a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total_items: usize,
}

/// Pending batch ids in submission order.
///
/// The queue holds ids only; the records live in the [`BatchStore`].
pub struct BatchQueue {
    store: Arc<BatchStore>,
    hub: Arc<ProgressHub>,
    pending: Mutex<VecDeque<BatchId>>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl BatchQueue {
    pub fn new(store: Arc<BatchStore>, hub: Arc<ProgressHub>) -> Self {
        Self {
            store,
            hub,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<BatchId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a batch and enqueue it for pickup.
    pub fn submit(&self, spec: BatchSpec) -> Result<SubmitReceipt, CoreError> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }

        let total_items = spec.items.len();
        let batch_id = self.store.create(spec)?;
        self.pending().push_back(batch_id);
        self.notify.notify_one();

        Ok(SubmitReceipt {
            batch_id,
            status: BatchStatus::Pending,
            total_items,
        })
    }

    /// Pop the oldest pending batch, waiting until one arrives.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn dequeue(&self) -> Option<BatchId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a submit between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(id) = self.pending().pop_front() {
                return Some(id);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Cancel a batch.
    ///
    /// A batch still waiting in the queue is removed and finalized as
    /// `Cancelled` on the spot, with exactly one `cancelled` event. A batch
    /// already handed to a worker gets the cooperative flag instead.
    pub fn cancel(&self, id: BatchId) -> Result<CancelOutcome, CoreError> {
        let removed = {
            let mut pending = self.pending();
            match pending.iter().position(|queued| *queued == id) {
                Some(pos) => pending.remove(pos).is_some(),
                None => false,
            }
        };

        if !removed {
            return self.store.cancel(id);
        }

        if let CancelOutcome::AlreadyTerminal(status) = self.store.cancel(id)? {
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }
        let batch = self.store.finalize(id, BatchStatus::Cancelled)?;

        let event = ProgressEvent::new(
            id,
            ProgressKind::Cancelled,
            "Batch cancelled before processing started",
        )
        .with_counts(batch.processed_count, batch.failed_count, batch.total_count)
        .with_total_bytes(batch.total_bytes);
        self.hub.publish(id, event);
        self.hub.close_batch(id);

        tracing::info!(batch_id = %id, "Queued batch cancelled");
        Ok(CancelOutcome::CancelledBeforeStart)
    }

    /// Wake every waiting worker and refuse further submissions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of batches waiting for a worker.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::StoreLimits;
    use assert_matches::assert_matches;
    use inkbatch_core::batch::ItemSpec;

    fn queue() -> (Arc<BatchStore>, Arc<ProgressHub>, BatchQueue) {
        let store = Arc::new(BatchStore::new(StoreLimits {
            max_items_per_batch: 10,
            max_in_flight_items: 20,
            retention: Duration::from_secs(60),
        }));
        let hub = Arc::new(ProgressHub::default());
        let queue = BatchQueue::new(Arc::clone(&store), Arc::clone(&hub));
        (store, hub, queue)
    }

    fn spec(n: usize) -> BatchSpec {
        BatchSpec {
            items: (0..n)
                .map(|i| ItemSpec {
                    label: format!("item {i}"),
                    input: serde_json::json!(i),
                })
                .collect(),
            params: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let (_, _, queue) = queue();
        let a = queue.submit(spec(1)).unwrap().batch_id;
        let b = queue.submit(spec(2)).unwrap().batch_id;

        assert_eq!(queue.dequeue().await, Some(a));
        assert_eq!(queue.dequeue().await, Some(b));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn submit_returns_pending_receipt() {
        let (store, _, queue) = queue();
        let receipt = queue.submit(spec(3)).unwrap();

        assert_eq!(receipt.status, BatchStatus::Pending);
        assert_eq!(receipt.total_items, 3);
        assert!(store.contains(receipt.batch_id));
    }

    #[tokio::test]
    async fn rejected_submission_is_not_enqueued() {
        let (store, _, queue) = queue();
        assert_matches!(queue.submit(spec(0)), Err(CoreError::Validation(_)));
        assert!(queue.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn dequeue_waits_for_submission() {
        let (_, _, queue) = queue();
        let queue = Arc::new(queue);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        let id = queue.submit(spec(1)).unwrap().batch_id;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dequeue woke up")
            .unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_refuses_submissions() {
        let (_, _, queue) = queue();
        let queue = Arc::new(queue);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();

        assert_eq!(waiter.await.unwrap(), None);
        assert_matches!(queue.submit(spec(1)), Err(CoreError::ShuttingDown));
    }

    #[tokio::test]
    async fn cancelling_queued_batch_finalizes_it_with_one_event() {
        let (store, hub, queue) = queue();
        let id = queue.submit(spec(3)).unwrap().batch_id;

        assert_eq!(queue.cancel(id).unwrap(), CancelOutcome::CancelledBeforeStart);
        assert!(queue.is_empty());

        let batch = store.get(id).unwrap();
        assert_eq!(batch.status, BatchStatus::Cancelled);
        assert!(batch.expires_at.is_some());
        assert_eq!(store.in_flight_items(), 0);

        let mut sub = hub.subscribe(id);
        let event = sub.next().await.expect("terminal event");
        assert_eq!(event.kind, ProgressKind::Cancelled);
        assert_eq!(event.total, 3);
        assert!(sub.next().await.is_none());

        // Second cancel is a no-op.
        assert_eq!(
            queue.cancel(id).unwrap(),
            CancelOutcome::AlreadyTerminal(BatchStatus::Cancelled)
        );
        assert_eq!(hub.last_event(id).map(|e| e.sequence), Some(1));
    }

    #[tokio::test]
    async fn cancelling_dequeued_batch_sets_flag() {
        let (store, _, queue) = queue();
        let id = queue.submit(spec(2)).unwrap().batch_id;
        queue.dequeue().await.unwrap();

        assert_eq!(
            queue.cancel(id).unwrap(),
            CancelOutcome::Requested(BatchStatus::Pending)
        );
        let batch = store.get(id).unwrap();
        assert!(batch.cancel_requested);
        assert_eq!(batch.status, BatchStatus::Pending);
    }
}
