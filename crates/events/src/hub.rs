//! Per-batch publish/subscribe hub.
//!
//! Each batch gets its own channel set guarded by its own mutex, so a slow
//! batch never contends with another one. Publishing stamps the sequence
//! number, appends to the replay buffer and fans out under that single
//! lock; subscribing snapshots the replay buffer and registers under the
//! same lock. A subscriber therefore sees replay and live events as one
//! gap-free, strictly increasing sequence.
//!
//! Fan-out never waits: every subscriber owns a bounded channel and one
//! that is full when an event arrives is dropped on the spot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use inkbatch_core::types::BatchId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::progress::ProgressEvent;

/// Default number of events replayed to a new subscriber.
pub const DEFAULT_REPLAY_CAPACITY: usize = 50;

/// Default channel depth per subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live registration on one batch.
///
/// Buffered history comes first (via [`next`](Subscription::next) or
/// [`into_parts`](Subscription::into_parts)), then live events. The live
/// half ends (`None`) when the batch is closed, when the subscriber is
/// dropped for falling behind, or after [`ProgressHub::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub batch_id: BatchId,
    replay: VecDeque<ProgressEvent>,
    receiver: mpsc::Receiver<ProgressEvent>,
}

impl Subscription {
    /// Next event: replayed history first, then live delivery.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.receiver.recv().await
    }

    /// Number of replayed events not yet consumed.
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Split into the replayed history and the live receiver, for transports
    /// that build their own stream.
    pub fn into_parts(self) -> (Vec<ProgressEvent>, mpsc::Receiver<ProgressEvent>) {
        (self.replay.into_iter().collect(), self.receiver)
    }
}

// ---------------------------------------------------------------------------
// Per-batch channel set
// ---------------------------------------------------------------------------

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<ProgressEvent>,
}

#[derive(Default)]
struct BatchChannel {
    last_sequence: u64,
    replay: VecDeque<ProgressEvent>,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

fn lock(channel: &Mutex<BatchChannel>) -> MutexGuard<'_, BatchChannel> {
    channel.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ProgressHub
// ---------------------------------------------------------------------------

/// Fan-out hub for [`ProgressEvent`]s, keyed by batch.
///
/// Designed to be shared via `Arc<ProgressHub>`. The hub only carries
/// copies of events; it never owns batch records.
pub struct ProgressHub {
    batches: RwLock<HashMap<BatchId, Arc<Mutex<BatchChannel>>>>,
    replay_capacity: usize,
    subscriber_capacity: usize,
    next_subscriber_id: AtomicU64,
}

impl ProgressHub {
    /// Create a hub.
    ///
    /// * `replay_capacity` - events kept per batch for late subscribers.
    /// * `subscriber_capacity` - bounded channel depth per subscriber
    ///   (clamped to at least 1).
    pub fn new(replay_capacity: usize, subscriber_capacity: usize) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            replay_capacity,
            subscriber_capacity: subscriber_capacity.max(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    fn channel(&self, batch_id: BatchId) -> Arc<Mutex<BatchChannel>> {
        if let Some(channel) = self
            .batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&batch_id)
        {
            return Arc::clone(channel);
        }
        let mut batches = self
            .batches
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(batches.entry(batch_id).or_default())
    }

    fn existing(&self, batch_id: BatchId) -> Option<Arc<Mutex<BatchChannel>>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&batch_id)
            .cloned()
    }

    /// Register a subscriber and return the buffered history along with the
    /// live receiver.
    ///
    /// Subscribing to a closed batch yields its retained terminal event and
    /// an already-finished live half.
    pub fn subscribe(&self, batch_id: BatchId) -> Subscription {
        let channel = self.channel(batch_id);
        let mut ch = lock(&channel);

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.subscriber_capacity);
        let replay = ch.replay.clone();

        if !ch.closed {
            ch.subscribers.push(Subscriber { id, sender });
        }

        tracing::debug!(
            batch_id = %batch_id,
            subscriber_id = id,
            replayed = replay.len(),
            closed = ch.closed,
            "Progress subscriber attached",
        );

        Subscription {
            id,
            batch_id,
            replay,
            receiver,
        }
    }

    /// Remove a subscriber. Unknown ids are a no-op.
    pub fn unsubscribe(&self, batch_id: BatchId, subscriber_id: u64) {
        if let Some(channel) = self.existing(batch_id) {
            lock(&channel)
                .subscribers
                .retain(|sub| sub.id != subscriber_id);
        }
    }

    /// Stamp the next sequence number on `event` and deliver it to every
    /// live subscriber of `batch_id`.
    ///
    /// Returns the assigned sequence number, or `None` if the batch has
    /// already been closed (the event is discarded).
    pub fn publish(&self, batch_id: BatchId, mut event: ProgressEvent) -> Option<u64> {
        let channel = self.channel(batch_id);
        let mut ch = lock(&channel);

        if ch.closed {
            tracing::warn!(
                batch_id = %batch_id,
                kind = ?event.kind,
                "Dropping progress event published after close",
            );
            return None;
        }

        ch.last_sequence += 1;
        event.sequence = ch.last_sequence;
        event.batch_id = batch_id;

        if self.replay_capacity > 0 {
            if ch.replay.len() == self.replay_capacity {
                ch.replay.pop_front();
            }
            ch.replay.push_back(event.clone());
        }

        ch.subscribers
            .retain(|sub| match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        subscriber_id = sub.id,
                        sequence = event.sequence,
                        "Progress subscriber fell behind, dropping it",
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        batch_id = %batch_id,
                        subscriber_id = sub.id,
                        "Progress subscriber disconnected",
                    );
                    false
                }
            });

        Some(event.sequence)
    }

    /// End the stream for `batch_id`.
    ///
    /// Events already handed to subscriber channels are still delivered;
    /// the receivers then observe end-of-stream. The subscriber set and the
    /// replay history are discarded except for a trailing terminal event,
    /// which is kept so reconnecting clients still learn the outcome until
    /// [`forget`](Self::forget) is called.
    pub fn close_batch(&self, batch_id: BatchId) {
        let channel = self.channel(batch_id);
        let mut ch = lock(&channel);
        if ch.closed {
            return;
        }

        let dropped = ch.subscribers.len();
        ch.closed = true;
        ch.subscribers.clear();

        let terminal = ch.replay.pop_back().filter(|e| e.kind.is_terminal());
        ch.replay.clear();
        ch.replay.extend(terminal);

        tracing::debug!(
            batch_id = %batch_id,
            subscribers = dropped,
            "Progress stream closed",
        );
    }

    /// Discard everything the hub holds for `batch_id`. Called when the
    /// batch record is evicted.
    pub fn forget(&self, batch_id: BatchId) {
        let removed = self
            .batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&batch_id);
        if let Some(channel) = removed {
            lock(&channel).subscribers.clear();
        }
    }

    /// Most recent event published for `batch_id`, if still buffered.
    pub fn last_event(&self, batch_id: BatchId) -> Option<ProgressEvent> {
        self.existing(batch_id)
            .and_then(|channel| lock(&channel).replay.back().cloned())
    }

    pub fn subscriber_count(&self, batch_id: BatchId) -> usize {
        self.existing(batch_id)
            .map(|channel| lock(&channel).subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self, batch_id: BatchId) -> bool {
        self.existing(batch_id)
            .map(|channel| lock(&channel).closed)
            .unwrap_or(false)
    }

    /// Number of batches the hub currently tracks.
    pub fn batch_count(&self) -> usize {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
