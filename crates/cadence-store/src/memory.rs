//! In-memory schedule store.
//!
//! Backs tests and the local daemon. Thread-safe via a concurrent map;
//! the compare-and-swap transition holds the key's entry guard across the
//! check and the write, which is the whole concurrency story a single-
//! process store needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::cmp::Reverse;

use crate::error::StoreError;
use crate::store::ScheduleStore;
use crate::types::{Platform, ScheduledTask, TaskId, TaskStatus};

/// In-memory [`ScheduleStore`] over a concurrent map.
#[derive(Default)]
pub struct MemoryStore {
    tasks: DashMap<TaskId, ScheduledTask>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks (any status).
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn sorted_for_dispatch(mut tasks: Vec<ScheduledTask>, limit: usize) -> Vec<ScheduledTask> {
        tasks.sort_by_key(|t| (t.scheduled_for, Reverse(t.priority), t.created_at));
        tasks.truncate(limit);
        tasks
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn create(&self, task: ScheduledTask) -> Result<(), StoreError> {
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => Err(StoreError::TaskExists(task.id)),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, StoreError> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn transition(
        &self,
        updated: ScheduledTask,
        expected: TaskStatus,
    ) -> Result<ScheduledTask, StoreError> {
        match self.tasks.entry(updated.id) {
            Entry::Occupied(mut slot) => {
                let actual = slot.get().status;
                if actual != expected {
                    return Err(StoreError::StatusConflict { expected, actual });
                }
                slot.insert(updated.clone());
                Ok(updated)
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(updated.id)),
        }
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let due: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| t.clone())
            .collect();
        Ok(Self::sorted_for_dispatch(due, limit))
    }

    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let due: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|t| t.is_retry_due(now))
            .map(|t| t.clone())
            .collect();
        Ok(Self::sorted_for_dispatch(due, limit))
    }

    async fn find_in_window(
        &self,
        customer_id: &str,
        platform: Platform,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude: Option<TaskId>,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|t| {
                t.customer_id == customer_id
                    && t.platform == platform
                    && !t.status.is_terminal()
                    && t.scheduled_for >= from
                    && t.scheduled_for <= to
                    && exclude != Some(t.id)
            })
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.scheduled_for);
        Ok(tasks)
    }

    async fn list_for_customer(
        &self,
        customer_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|t| {
                t.customer_id == customer_id
                    && range.is_none_or(|(from, to)| {
                        t.scheduled_for >= from && t.scheduled_for <= to
                    })
            })
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.scheduled_for);
        Ok(tasks)
    }

    async fn count_instances(&self, parent: TaskId) -> Result<usize, StoreError> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| t.parent_schedule_id == Some(parent))
            .count())
    }
}
