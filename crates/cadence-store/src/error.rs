//! Error types for the store boundary.

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A task with this id already exists.
    #[error("task already exists: {0}")]
    TaskExists(TaskId),

    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A compare-and-swap transition lost the race: the stored status no
    /// longer matches what the caller observed.
    #[error("status conflict: expected {expected}, found {actual}")]
    StatusConflict {
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// The backing store is unreachable or failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
