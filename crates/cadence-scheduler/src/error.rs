//! Error types for the scheduling core.

use thiserror::Error;

use cadence_store::{EntityKind, StoreError, TaskId, TaskStatus};

use crate::conflict::ScheduleConflict;

/// Errors that can occur in scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad input. Rejected synchronously, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The recurrence pattern names an unknown IANA timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Blocking conflicts were found. The caller may review them and retry
    /// with `force` set.
    #[error("{} scheduling conflict(s) detected", .0.len())]
    Conflicts(Vec<ScheduleConflict>),

    /// The requested event is not valid from the task's current status.
    #[error("cannot {event} a {from} task")]
    InvalidTransition {
        from: TaskStatus,
        event: &'static str,
    },

    /// The task is already in a terminal state; nothing to do.
    #[error("task already terminal: {0}")]
    AlreadyTerminal(TaskStatus),

    /// Resuming a paused task whose scheduled time has passed requires an
    /// explicit new time.
    #[error("scheduled time has passed; a new time is required to resume")]
    TimePassed,

    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// No execution handler registered for this entity kind.
    #[error("no handler registered for entity kind {0}")]
    NoHandler(EntityKind),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}
