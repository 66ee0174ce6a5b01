use crate::batch::BatchStatus;
use crate::types::BatchId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(
        "Capacity exceeded: {requested} item(s) requested, {in_flight} of {ceiling} in-flight slots in use"
    )]
    CapacityExceeded {
        requested: usize,
        in_flight: usize,
        ceiling: usize,
    },

    #[error("Batch not found: {0}")]
    NotFound(BatchId),

    #[error("Batch {0} is already claimed")]
    AlreadyClaimed(BatchId),

    #[error("Batch {id} is not ready (status: {status})")]
    NotReady { id: BatchId, status: BatchStatus },

    #[error("Batch engine is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure reported by a unit-of-work for a single item.
///
/// The classification decides whether the worker spends retry budget on
/// the item or fails it immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    /// Temporary condition (timeout, overloaded backend). Retried.
    #[error("transient: {0}")]
    Transient(String),

    /// The item can never succeed as submitted. Not retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ItemError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The message without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_mentions_all_counts() {
        let err = CoreError::CapacityExceeded {
            requested: 20,
            in_flight: 95,
            ceiling: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("20 item(s)"));
        assert!(msg.contains("95 of 100"));
    }

    #[test]
    fn not_ready_includes_status() {
        let id = crate::types::new_batch_id();
        let err = CoreError::NotReady {
            id,
            status: BatchStatus::Processing,
        };
        assert!(err.to_string().contains("processing"));
    }

    #[test]
    fn item_error_classification() {
        assert!(ItemError::transient("timeout").is_transient());
        assert!(!ItemError::permanent("bad prompt").is_transient());
        assert_eq!(ItemError::permanent("bad prompt").message(), "bad prompt");
    }
}
