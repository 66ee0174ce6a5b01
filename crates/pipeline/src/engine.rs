//! Explicit registry tying the batch components together.
//!
//! A [`BatchEngine`] is constructed once at startup and shared through an
//! `Arc`. Nothing runs until [`BatchEngine::start`] spawns the worker loops
//! and the sweeper; [`EngineHandle::shutdown`] stops them again.

use std::sync::Arc;

use inkbatch_core::batch::{BatchSpec, BatchStatus, BatchSummary};
use inkbatch_core::config::BatchConfig;
use inkbatch_core::error::CoreError;
use inkbatch_core::types::{BatchId, Timestamp};
use inkbatch_events::{ProgressEvent, ProgressHub, Subscription};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{Archive, ArchiveAssembler};
use crate::outputs::OutputStore;
use crate::queue::{BatchQueue, SubmitReceipt};
use crate::store::{BatchStore, CancelOutcome, StoreLimits};
use crate::sweeper::Sweeper;
use crate::unit_of_work::UnitOfWork;
use crate::worker::Worker;

/// Point-in-time snapshot of a batch, for clients that poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusView {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_bytes: u64,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub last_event: Option<ProgressEvent>,
}

pub struct BatchEngine {
    config: BatchConfig,
    store: Arc<BatchStore>,
    hub: Arc<ProgressHub>,
    queue: Arc<BatchQueue>,
    outputs: Arc<OutputStore>,
    archives: ArchiveAssembler,
    sweeper: Arc<Sweeper>,
}

impl BatchEngine {
    pub fn new(config: BatchConfig) -> Self {
        let store = Arc::new(BatchStore::new(StoreLimits::from(&config)));
        let hub = Arc::new(ProgressHub::new(
            config.replay_buffer_size,
            config.subscriber_capacity,
        ));
        let queue = Arc::new(BatchQueue::new(Arc::clone(&store), Arc::clone(&hub)));
        let outputs = Arc::new(OutputStore::new(config.output_dir.clone()));
        let archives = ArchiveAssembler::new(Arc::clone(&store));
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&outputs),
            config.sweep_interval,
        ));

        Self {
            config,
            store,
            hub,
            queue,
            outputs,
            archives,
            sweeper,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Spawn `worker_count` worker loops and the sweeper.
    pub fn start(&self, unit: Arc<dyn UnitOfWork>) -> EngineHandle {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.config.worker_count + 1);

        for id in 1..=self.config.worker_count {
            let worker = Worker::new(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.store),
                Arc::clone(&self.hub),
                Arc::clone(&self.outputs),
                Arc::clone(&unit),
                self.config.retry,
            );
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { worker.run(token).await }));
        }

        let sweeper = Arc::clone(&self.sweeper);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { sweeper.run(token).await }));

        tracing::info!(
            workers = self.config.worker_count,
            output_dir = %self.config.output_dir.display(),
            "Batch engine started",
        );

        EngineHandle {
            cancel,
            queue: Arc::clone(&self.queue),
            tasks,
        }
    }

    pub fn submit(&self, spec: BatchSpec) -> Result<SubmitReceipt, CoreError> {
        self.queue.submit(spec)
    }

    pub fn status(&self, id: BatchId) -> Result<BatchStatusView, CoreError> {
        let mut view = self.store.inspect(id, |batch| BatchStatusView {
            batch_id: batch.id,
            status: batch.status,
            total: batch.total_count,
            processed: batch.processed_count,
            failed: batch.failed_count,
            skipped: if batch.status.is_terminal() {
                batch.skipped_count()
            } else {
                0
            },
            total_bytes: batch.total_bytes,
            cancel_requested: batch.cancel_requested,
            created_at: batch.created_at,
            started_at: batch.started_at,
            completed_at: batch.completed_at,
            expires_at: batch.expires_at,
            last_event: None,
        })?;
        view.last_event = self.hub.last_event(id);
        Ok(view)
    }

    pub fn list(&self, status: Option<BatchStatus>) -> Vec<BatchSummary> {
        self.store.list(status)
    }

    /// Attach a progress subscriber to a known batch.
    pub fn subscribe(&self, id: BatchId) -> Result<Subscription, CoreError> {
        if !self.store.contains(id) {
            return Err(CoreError::NotFound(id));
        }
        let subscription = self.hub.subscribe(id);

        // The sweeper may have evicted the batch in between; do not leave an
        // orphan channel behind.
        if !self.store.contains(id) {
            self.hub.forget(id);
            return Err(CoreError::NotFound(id));
        }
        Ok(subscription)
    }

    pub fn unsubscribe(&self, id: BatchId, subscriber_id: u64) {
        self.hub.unsubscribe(id, subscriber_id);
    }

    /// Idempotent cancel; a terminal batch is left untouched.
    pub fn cancel(&self, id: BatchId) -> Result<CancelOutcome, CoreError> {
        self.queue.cancel(id)
    }

    pub fn archive(&self, id: BatchId) -> Result<Archive, CoreError> {
        self.archives.build(id)
    }

    /// Run one sweep pass immediately.
    pub async fn sweep_now(&self) -> Vec<BatchId> {
        self.sweeper.sweep_once().await
    }
}

/// Owns the spawned engine tasks.
pub struct EngineHandle {
    cancel: CancellationToken,
    queue: Arc<BatchQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop accepting work, let workers finish their current item and wait
    /// for every task to exit.
    pub async fn shutdown(self) {
        tracing::info!("Batch engine shutting down");
        self.queue.shutdown();
        self.cancel.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Batch engine task panicked");
            }
        }
        tracing::info!("Batch engine stopped");
    }
}
