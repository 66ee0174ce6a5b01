//! Batch processing pipeline: admission, worker loops, output storage,
//! archive assembly and TTL eviction.
//!
//! [`BatchEngine`] is the entry point for transports; the individual
//! components are public for embedding and testing.

pub mod archive;
pub mod engine;
pub mod outputs;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod unit_of_work;
pub mod worker;

pub use archive::{Archive, ArchiveAssembler, ArchiveStream, Manifest};
pub use engine::{BatchEngine, BatchStatusView, EngineHandle};
pub use outputs::OutputStore;
pub use queue::{BatchQueue, SubmitReceipt};
pub use store::{BatchStore, CancelOutcome, StoreLimits};
pub use unit_of_work::{RenderedOutput, UnitOfWork, WorkItem};
pub use worker::Worker;
