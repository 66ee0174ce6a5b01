//! Inkbatch progress broadcasting.
//!
//! - [`ProgressEvent`]: immutable description of one observable change to a
//!   batch, sequenced per batch.
//! - [`ProgressHub`]: per-batch publish/subscribe fan-out with a bounded
//!   replay buffer for late subscribers.

pub mod hub;
pub mod progress;

pub use hub::{ProgressHub, Subscription};
pub use progress::{ProgressEvent, ProgressKind};
