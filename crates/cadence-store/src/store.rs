//! The storage boundary consumed by the scheduler core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{Platform, ScheduledTask, TaskId, TaskStatus};

/// Durable, queryable collection of [`ScheduledTask`] records.
///
/// Implementations own storage and indexed lookup only; every scheduling
/// decision lives in the scheduler crate. An in-memory map and a durable
/// store both satisfy this contract.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new task. Fails with [`StoreError::TaskExists`] on a
    /// duplicate id.
    async fn create(&self, task: ScheduledTask) -> Result<(), StoreError>;

    /// Fetch a task by id.
    async fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, StoreError>;

    /// Apply a status transition with optimistic concurrency: `updated` is
    /// written only if the stored status still equals `expected`, otherwise
    /// [`StoreError::StatusConflict`] is returned and nothing changes.
    ///
    /// All task mutations go through this, so two workers picking up the
    /// same task resolve deterministically: one wins, one observes the
    /// conflict.
    async fn transition(
        &self,
        updated: ScheduledTask,
        expected: TaskStatus,
    ) -> Result<ScheduledTask, StoreError>;

    /// Pending tasks whose `scheduled_for` (and `next_retry_at`, if set)
    /// has passed, ordered by scheduled time, then priority (urgent
    /// first), then creation time.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError>;

    /// Failed tasks whose `next_retry_at` has passed, same ordering as
    /// [`ScheduleStore::find_due`].
    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError>;

    /// Non-terminal tasks for one customer and platform scheduled within
    /// `[from, to]`, optionally excluding one id (used when re-checking a
    /// reschedule of the same task).
    async fn find_in_window(
        &self,
        customer_id: &str,
        platform: Platform,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude: Option<TaskId>,
    ) -> Result<Vec<ScheduledTask>, StoreError>;

    /// All tasks for one customer, optionally restricted to those
    /// scheduled within `[from, to]`.
    async fn list_for_customer(
        &self,
        customer_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ScheduledTask>, StoreError>;

    /// Number of instances spawned from a recurring template.
    async fn count_instances(&self, parent: TaskId) -> Result<usize, StoreError>;
}
