//! Run-level errors
//!
//! Single-item failures never surface here; they land on the item as
//! `failed`. These are the conditions that stop a run or reject a request.

use super::events::RunState;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: RunState },

    #[error("no work item at index {0}")]
    ItemNotFound(usize),

    #[error("work item {0} is in flight")]
    ItemInFlight(usize),

    #[error("no roll result {id} for work item {index}")]
    RollNotFound { index: usize, id: i64 },

    #[error("work item {index} failed: {reason}")]
    ItemFailed { index: usize, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
