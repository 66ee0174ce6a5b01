//! Inkbatch domain core.
//!
//! Pure types shared by every other crate: batch and item records, status
//! state machines, the error taxonomy, retry policy, and configuration.
//! Has no internal dependencies and performs no I/O.

pub mod batch;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;
