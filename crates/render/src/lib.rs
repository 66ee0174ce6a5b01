//! Remote render service integration.
//!
//! [`RenderClient`] implements the pipeline's unit-of-work by calling an
//! external generation service over HTTP.

pub mod client;

pub use client::{is_transient_status, RenderClient, RenderError};
