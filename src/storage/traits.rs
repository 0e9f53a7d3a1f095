//! Storage trait definitions

use crate::pipeline::PersistedRunState;
use crate::worldbook::{HistoryRecord, Worldbook};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("History record not found: {0}")]
    HistoryNotFound(i64),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A structured result produced for a work item, accepted or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollResult {
    pub id: i64,
    pub item_index: usize,
    pub result: Worldbook,
    pub created_at: DateTime<Utc>,
}

/// Durable state behind the pipeline.
///
/// Every operation is atomic for the single record it touches; callers never
/// rely on transactions spanning records. Implementations must be thread-safe
/// (Send + Sync) since item tasks record roll results concurrently.
pub trait StateStore: Send + Sync {
    // === Run State ===

    /// Replace the persisted run state
    fn save_run_state(&self, state: &PersistedRunState) -> StorageResult<()>;

    /// Load the persisted run state, if any
    fn load_run_state(&self) -> StorageResult<Option<PersistedRunState>>;

    /// Forget the persisted run state
    fn clear_run_state(&self) -> StorageResult<()>;

    // === History ===

    /// Append a record, returning its assigned sequence id.
    ///
    /// The record's own `sequence_id` is ignored.
    fn append_history(&self, record: &HistoryRecord) -> StorageResult<i64>;

    /// All records in sequence order
    fn list_history(&self) -> StorageResult<Vec<HistoryRecord>>;

    /// Load one record
    fn get_history(&self, sequence_id: i64) -> StorageResult<Option<HistoryRecord>>;

    /// Delete one record
    fn delete_history(&self, sequence_id: i64) -> StorageResult<bool>;

    /// Delete the record `sequence_id` and every later one. Returns the count.
    fn delete_history_from(&self, sequence_id: i64) -> StorageResult<usize>;

    /// Delete all records. Returns the count.
    fn clear_history(&self) -> StorageResult<usize>;

    // === Roll Results ===

    /// Record a candidate result for the item at `item_index`
    fn save_roll_result(&self, item_index: usize, result: &Worldbook) -> StorageResult<i64>;

    /// Candidates for an item, oldest first
    fn list_roll_results(&self, item_index: usize) -> StorageResult<Vec<RollResult>>;

    /// Drop every candidate for an item. Returns the count.
    fn clear_roll_results(&self, item_index: usize) -> StorageResult<usize>;

    /// Re-key candidates at `from_index` and above by `delta` positions,
    /// following an insertion into the queue.
    fn shift_roll_results(&self, from_index: usize, delta: usize) -> StorageResult<()>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: StateStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
