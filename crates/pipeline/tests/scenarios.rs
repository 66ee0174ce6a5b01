//! End-to-end batch runs through a started engine.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::StreamExt;
use inkbatch_core::batch::{BatchSpec, BatchStatus, ItemSpec, ItemState};
use inkbatch_core::config::BatchConfig;
use inkbatch_core::error::{CoreError, ItemError};
use inkbatch_core::retry::RetryPolicy;
use inkbatch_core::types::BatchId;
use inkbatch_events::{ProgressEvent, ProgressKind, Subscription};
use inkbatch_pipeline::{BatchEngine, CancelOutcome, RenderedOutput, UnitOfWork, WorkItem};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Succeeds for every item except the listed indices, which fail
/// permanently.
struct FailingAt(HashSet<usize>);

#[async_trait]
impl UnitOfWork for FailingAt {
    async fn execute(&self, item: &WorkItem) -> Result<RenderedOutput, ItemError> {
        if self.0.contains(&item.index) {
            return Err(ItemError::permanent(format!("cannot render {}", item.label)));
        }
        Ok(RenderedOutput::new(
            format!("{}.png", item.label),
            format!("image {}", item.index).into_bytes(),
        ))
    }
}

/// Pauses on one item until released.
struct Gated {
    index: usize,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl UnitOfWork for Gated {
    async fn execute(&self, item: &WorkItem) -> Result<RenderedOutput, ItemError> {
        if item.index == self.index {
            self.started.notify_one();
            self.release.notified().await;
        }
        Ok(RenderedOutput::new(format!("{}.png", item.label), vec![1u8; 8]))
    }
}

/// Panics on items labelled `page-1`.
struct PanicsOnFirstPage;

#[async_trait]
impl UnitOfWork for PanicsOnFirstPage {
    async fn execute(&self, item: &WorkItem) -> Result<RenderedOutput, ItemError> {
        if item.label == "page-1" {
            panic!("renderer crashed");
        }
        Ok(RenderedOutput::new(format!("{}.png", item.label), vec![2u8; 4]))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dir: &Path) -> BatchConfig {
    BatchConfig {
        output_dir: dir.to_path_buf(),
        worker_count: 2,
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        ..BatchConfig::default()
    }
}

fn spec(n: usize) -> BatchSpec {
    BatchSpec {
        items: (1..=n)
            .map(|i| ItemSpec {
                label: format!("page-{i}"),
                input: serde_json::json!({ "page": i }),
            })
            .collect(),
        params: serde_json::json!({ "style": "line-art" }),
    }
}

async fn drain(mut sub: Subscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("event stream stalled");
        match next {
            Some(event) => events.push(event),
            None => break,
        }
    }
    events
}

async fn wait_terminal(engine: &BatchEngine, id: BatchId) -> BatchStatus {
    for _ in 0..500 {
        let status = engine.status(id).unwrap().status;
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {id} never reached a terminal state");
}

async fn archive_bytes(engine: &BatchEngine, id: BatchId) -> Vec<u8> {
    let archive = engine.archive(id).unwrap();
    let chunks: Vec<_> = archive.stream.collect().await;
    chunks
        .into_iter()
        .flat_map(|chunk| chunk.unwrap().to_vec())
        .collect()
}

fn read_manifest(zip: &mut zip::ZipArchive<std::io::Cursor<Vec<u8>>>) -> serde_json::Value {
    let mut raw = String::new();
    zip.by_name("manifest.json")
        .unwrap()
        .read_to_string(&mut raw)
        .unwrap();
    serde_json::from_str(&raw).unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_failure_completes_with_failure_report() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(config(dir.path()));
    let handle = engine.start(Arc::new(FailingAt(HashSet::from([1]))));

    let id = engine.submit(spec(3)).unwrap().batch_id;
    let events = drain(engine.subscribe(id).unwrap()).await;

    assert_eq!(wait_terminal(&engine, id).await, BatchStatus::Completed);
    let batch = engine.store().get(id).unwrap();
    assert_eq!((batch.processed_count, batch.failed_count), (2, 1));
    assert_eq!(batch.items[1].state, ItemState::Failed);
    assert_eq!(batch.items[1].attempts, 1);

    let terminal: Vec<_> = events.iter().filter(|e| e.kind.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, ProgressKind::Completed);
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive_bytes(&engine, id).await))
        .unwrap();
    assert_eq!(zip.len(), 3);
    let manifest = read_manifest(&mut zip);
    assert_eq!(manifest["processed"], 2);
    assert_eq!(manifest["failed"], 1);
    assert_eq!(manifest["failures"][0]["index"], 1);
    assert_eq!(manifest["entries"].as_array().unwrap().len(), 2);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_item_failing_marks_batch_failed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(config(dir.path()));
    let handle = engine.start(Arc::new(FailingAt(HashSet::from([0, 1]))));

    let id = engine.submit(spec(2)).unwrap().batch_id;

    assert_eq!(wait_terminal(&engine, id).await, BatchStatus::Failed);
    let view = engine.status(id).unwrap();
    let last = view.last_event.unwrap();
    assert_eq!(last.kind, ProgressKind::Failed);
    assert!(last.error.is_some());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_batch_keeps_completed_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(config(dir.path()));
    let unit = Arc::new(Gated {
        index: 1,
        started: Notify::new(),
        release: Notify::new(),
    });
    let handle = engine.start(unit.clone());

    let id = engine.submit(spec(5)).unwrap().batch_id;
    unit.started.notified().await;

    assert_eq!(
        engine.cancel(id).unwrap(),
        CancelOutcome::Requested(BatchStatus::Processing)
    );
    unit.release.notify_one();

    assert_eq!(wait_terminal(&engine, id).await, BatchStatus::Cancelled);
    let batch = engine.store().get(id).unwrap();
    assert_eq!(batch.processed_count, 2);
    assert!(batch.items[2..].iter().all(|i| i.state == ItemState::Pending));

    // Cancelling again is a no-op and publishes nothing.
    let before = engine.status(id).unwrap().last_event.unwrap().sequence;
    assert_eq!(
        engine.cancel(id).unwrap(),
        CancelOutcome::AlreadyTerminal(BatchStatus::Cancelled)
    );
    assert_eq!(engine.status(id).unwrap().last_event.unwrap().sequence, before);

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive_bytes(&engine, id).await))
        .unwrap();
    assert_eq!(zip.len(), 3);
    let manifest = read_manifest(&mut zip);
    assert_eq!(manifest["status"], "cancelled");
    assert_eq!(manifest["skipped"], 3);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archive_before_terminal_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(config(dir.path()));
    let unit = Arc::new(Gated {
        index: 0,
        started: Notify::new(),
        release: Notify::new(),
    });
    let handle = engine.start(unit.clone());

    let id = engine.submit(spec(1)).unwrap().batch_id;
    unit.started.notified().await;

    assert_matches!(
        engine.archive(id),
        Err(CoreError::NotReady {
            status: BatchStatus::Processing,
            ..
        })
    );

    unit.release.notify_one();
    assert_eq!(wait_terminal(&engine, id).await, BatchStatus::Completed);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_after_close_still_sees_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(config(dir.path()));
    let handle = engine.start(Arc::new(FailingAt(HashSet::new())));

    let id = engine.submit(spec(2)).unwrap().batch_id;
    wait_terminal(&engine, id).await;
    // Give the worker a moment to close the stream after finalizing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(engine.subscribe(id).unwrap()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ProgressKind::Completed);
    assert_eq!(events[0].processed, 2);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn over_capacity_submission_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig {
        max_in_flight_items: 4,
        ..config(dir.path())
    });

    engine.submit(spec(3)).unwrap();
    assert_matches!(
        engine.submit(spec(2)),
        Err(CoreError::CapacityExceeded { ceiling: 4, .. })
    );
    assert_eq!(engine.list(None).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_evicts_finished_batch_and_its_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig {
        retention: Duration::ZERO,
        sweep_interval: Duration::from_secs(3600),
        ..config(dir.path())
    });
    let handle = engine.start(Arc::new(FailingAt(HashSet::new())));

    let id = engine.submit(spec(2)).unwrap().batch_id;
    wait_terminal(&engine, id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let evicted = engine.sweep_now().await;
    assert_eq!(evicted, vec![id]);
    assert_matches!(engine.status(id), Err(CoreError::NotFound(_)));
    assert!(!dir.path().join(id.to_string()).exists());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_unit_of_work_does_not_stall_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = BatchEngine::new(BatchConfig {
        worker_count: 1,
        ..config(dir.path())
    });
    let handle = engine.start(Arc::new(PanicsOnFirstPage));

    let first = engine.submit(spec(1)).unwrap().batch_id;
    let second = engine.submit(spec(3)).unwrap().batch_id;

    assert_eq!(wait_terminal(&engine, first).await, BatchStatus::Failed);
    assert_eq!(wait_terminal(&engine, second).await, BatchStatus::Completed);
    let batch = engine.store().get(second).unwrap();
    assert_eq!((batch.processed_count, batch.failed_count), (2, 1));
    assert_eq!(engine.store().in_flight_items(), 0);
    assert_eq!(
        engine.status(first).unwrap().last_event.map(|e| e.kind),
        Some(ProgressKind::Failed)
    );

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_deletes_outputs_left_by_a_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let leftover = dir.path().join(inkbatch_core::types::new_batch_id().to_string());
    std::fs::create_dir(&leftover).unwrap();
    std::fs::write(leftover.join("0000-page-1.png"), b"stale").unwrap();

    let engine = BatchEngine::new(config(dir.path()));
    let handle = engine.start(Arc::new(FailingAt(HashSet::new())));

    for _ in 0..200 {
        if !leftover.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!leftover.exists());

    handle.shutdown().await;
}
