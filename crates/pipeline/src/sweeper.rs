//! Periodic eviction of expired batches.
//!
//! Spawned by [`BatchEngine::start`](crate::engine::BatchEngine::start).
//! Each tick evicts terminal batches past their retention window, then drops
//! their hub channels and output files. Before the first tick it deletes
//! output directories left behind by a previous process, since batch
//! records do not survive a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inkbatch_core::types::BatchId;
use inkbatch_events::ProgressHub;
use tokio_util::sync::CancellationToken;

use crate::outputs::OutputStore;
use crate::store::BatchStore;

pub struct Sweeper {
    store: Arc<BatchStore>,
    hub: Arc<ProgressHub>,
    outputs: Arc<OutputStore>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<BatchStore>,
        hub: Arc<ProgressHub>,
        outputs: Arc<OutputStore>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            outputs,
            interval,
        }
    }

    /// Run the sweep loop until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Batch sweeper started"
        );

        self.purge_orphans().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Batch sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Delete output directories that belong to no known batch.
    pub async fn purge_orphans(&self) -> Vec<BatchId> {
        match self.outputs.remove_orphans(|id| self.store.contains(id)).await {
            Ok(removed) => {
                if !removed.is_empty() {
                    tracing::info!(removed = removed.len(), "Deleted orphaned batch outputs");
                }
                removed
            }
            Err(e) => {
                tracing::error!(
                    root = %self.outputs.root().display(),
                    error = %e,
                    "Failed to scan for orphaned batch outputs",
                );
                Vec::new()
            }
        }
    }

    /// One sweep pass. Returns the evicted batch ids.
    pub async fn sweep_once(&self) -> Vec<BatchId> {
        let evicted = self.store.sweep(Utc::now());
        if evicted.is_empty() {
            tracing::debug!("Batch sweep: nothing expired");
            return evicted;
        }

        for id in &evicted {
            self.hub.forget(*id);
            if let Err(e) = self.outputs.remove_batch(*id).await {
                tracing::error!(batch_id = %id, error = %e, "Failed to delete batch outputs");
            }
        }
        tracing::info!(evicted = evicted.len(), "Batch sweep: evicted expired batches");
        evicted
    }
}
