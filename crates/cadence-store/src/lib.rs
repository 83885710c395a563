//! Task records and storage boundary for Cadence.
//!
//! This crate owns the persisted shape of a scheduled task and the
//! `ScheduleStore` trait the scheduler core consumes:
//! - Record types with serde derives (any backing store can persist them)
//! - Status transitions applied through compare-and-swap, so two workers
//!   racing on the same task lose deterministically
//! - An in-memory `MemoryStore` used by tests and the local daemon

mod error;
mod memory;
mod store;
mod types;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::ScheduleStore;
pub use types::{
    EntityKind, ExecutionError, ExecutionRecord, ExecutionResult, Platform, Priority,
    RecurrenceFrequency, RecurrencePattern, ScheduledTask, TaskId, TaskStatus,
};
