/// Batch identifiers are time-ordered UUIDs (v7), opaque to callers.
pub type BatchId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh batch id.
pub fn new_batch_id() -> BatchId {
    uuid::Uuid::now_v7()
}
