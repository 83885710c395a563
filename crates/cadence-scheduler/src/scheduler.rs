//! The scheduling service: every operation the outer surface consumes.
//!
//! Owns validation, conflict/rate-limit checks, lifecycle application
//! through the store's compare-and-swap, and recurrence advancement.
//! Transport (HTTP, CLI) lives outside this crate.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use cadence_store::{
    EntityKind, ExecutionResult, Platform, Priority, RecurrencePattern, ScheduleStore,
    ScheduledTask, StoreError, TaskId, TaskStatus,
};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::conflict::{ConflictDetector, ConflictKind, ConflictSeverity, ScheduleConflict};
use crate::error::SchedulerError;
use crate::lifecycle;
use crate::rate_limit::{Admission, RateLimiter};
use crate::recurrence::RecurrenceExpander;
use crate::retry::RetryPolicy;

/// Input to [`Scheduler::schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub customer_id: String,
    pub platform: Platform,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub priority: Priority,
    pub recurrence: Option<RecurrencePattern>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub requested_by: Option<String>,
    /// Proceed despite blocking conflicts.
    pub force: bool,
}

impl ScheduleRequest {
    pub fn new(
        customer_id: impl Into<String>,
        platform: Platform,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            platform,
            entity_kind,
            entity_id: entity_id.into(),
            scheduled_for,
            priority: Priority::Normal,
            recurrence: None,
            tags: Vec::new(),
            notes: None,
            requested_by: None,
            force: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_recurrence(mut self, recurrence: RecurrencePattern) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// How bulk scheduling assigns times across requests.
#[derive(Debug, Clone, Copy)]
pub enum DistributionStrategy {
    /// Keep each request's own scheduled time.
    AsProvided,
    /// Space requests evenly across `[start, end]`, overriding their
    /// times.
    SpreadEven {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// One rejected entry from a bulk request.
#[derive(Debug, Clone)]
pub struct BulkRejection {
    /// Index into the original request list.
    pub index: usize,
    pub error: String,
}

/// Outcome of a bulk scheduling call: partial success is normal.
#[derive(Debug, Clone, Default)]
pub struct BulkScheduleResult {
    pub scheduled: Vec<ScheduledTask>,
    pub rejected: Vec<BulkRejection>,
}

/// Filter for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub platform: Option<Platform>,
    pub tag: Option<String>,
}

/// Aggregate scheduling statistics for one customer.
#[derive(Debug, Clone, Default)]
pub struct ScheduleStatistics {
    pub total: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_platform: HashMap<Platform, usize>,
    /// Tasks still waiting for a future scheduled time.
    pub upcoming: usize,
    pub total_attempts: usize,
    pub successful_attempts: usize,
    /// Successful attempts over all attempts; 0.0 with no history.
    pub success_rate: f64,
}

/// The scheduling core.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    detector: ConflictDetector,
    limiter: RateLimiter,
    retry_policy: RetryPolicy,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        let detector = ConflictDetector::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&config),
        );
        let limiter = RateLimiter::new(Arc::clone(&config));
        let retry_policy = RetryPolicy::from_config(&config);
        Self {
            store,
            clock,
            config,
            detector,
            limiter,
            retry_policy,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and create a task. Blocking conflicts reject the request
    /// unless `force` is set; warnings ride along with the created task.
    #[tracing::instrument(skip(self, request), fields(customer = %request.customer_id, platform = %request.platform))]
    pub async fn schedule(
        &self,
        request: ScheduleRequest,
    ) -> Result<(ScheduledTask, Vec<ScheduleConflict>), SchedulerError> {
        let now = self.clock.now();
        self.validate(&request, now)?;

        let conflicts = self
            .conflicts_for(
                &request.customer_id,
                request.platform,
                request.scheduled_for,
                None,
            )
            .await?;
        if !request.force && conflicts.iter().any(ScheduleConflict::is_blocking) {
            return Err(SchedulerError::Conflicts(conflicts));
        }

        let mut task = ScheduledTask::new(
            request.customer_id,
            request.platform,
            request.entity_kind,
            request.entity_id,
            request.scheduled_for,
            self.config.max_retries,
            now,
        );
        task.priority = request.priority;
        task.recurrence = request.recurrence;
        task.tags = request.tags;
        task.notes = request.notes;
        task.created_by = request.requested_by.clone();
        task.updated_by = request.requested_by;

        self.store.create(task.clone()).await?;
        info!(
            task_id = %task.id,
            scheduled_for = %task.scheduled_for,
            recurring = task.is_template(),
            "task scheduled"
        );
        Ok((task, conflicts))
    }

    /// Move a pending or paused task to a new time, re-checking conflicts
    /// (excluding the task itself).
    pub async fn reschedule(
        &self,
        id: TaskId,
        new_time: DateTime<Utc>,
        force: bool,
    ) -> Result<ScheduledTask, SchedulerError> {
        let task = self.require(id).await?;
        let conflicts = self
            .conflicts_for(&task.customer_id, task.platform, new_time, Some(id))
            .await?;
        if !force && conflicts.iter().any(ScheduleConflict::is_blocking) {
            return Err(SchedulerError::Conflicts(conflicts));
        }

        let updated = lifecycle::reschedule(&task, new_time, self.clock.now())?;
        let stored = self.store.transition(updated, task.status).await?;
        info!(task_id = %id, new_time = %new_time, "task rescheduled");
        Ok(stored)
    }

    /// Cancel a pending, paused, or failed task. Cancelling an already
    /// terminal task is a no-op error; cancelling a running task is not
    /// supported (the in-flight execution completes and records its
    /// outcome).
    pub async fn cancel(
        &self,
        id: TaskId,
        reason: Option<String>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let task = self.require(id).await?;
        let updated = lifecycle::cancel(&task, reason, self.clock.now())?;
        let stored = self.store.transition(updated, task.status).await?;
        info!(task_id = %id, reason = ?stored.cancel_reason, "task cancelled");
        Ok(stored)
    }

    pub async fn pause(&self, id: TaskId) -> Result<ScheduledTask, SchedulerError> {
        let task = self.require(id).await?;
        let updated = lifecycle::pause(&task, self.clock.now())?;
        let stored = self.store.transition(updated, task.status).await?;
        info!(task_id = %id, "task paused");
        Ok(stored)
    }

    pub async fn resume(
        &self,
        id: TaskId,
        new_time: Option<DateTime<Utc>>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let task = self.require(id).await?;
        let updated = lifecycle::resume(&task, new_time, self.clock.now())?;
        let stored = self.store.transition(updated, task.status).await?;
        info!(task_id = %id, scheduled_for = %stored.scheduled_for, "task resumed");
        Ok(stored)
    }

    /// Schedule a batch, optionally redistributing times. Individual
    /// failures do not abort the batch.
    pub async fn bulk_schedule(
        &self,
        mut requests: Vec<ScheduleRequest>,
        strategy: DistributionStrategy,
    ) -> Result<BulkScheduleResult, SchedulerError> {
        if requests.is_empty() {
            return Ok(BulkScheduleResult::default());
        }
        if let DistributionStrategy::SpreadEven { start, end } = strategy {
            if end <= start {
                return Err(SchedulerError::Validation(
                    "distribution range must end after it starts".into(),
                ));
            }
            let step = (end - start) / requests.len() as i32;
            for (i, request) in requests.iter_mut().enumerate() {
                request.scheduled_for = start + step * i as i32;
            }
        }

        let mut result = BulkScheduleResult::default();
        for (index, request) in requests.into_iter().enumerate() {
            match self.schedule(request).await {
                Ok((task, _)) => result.scheduled.push(task),
                Err(e) => result.rejected.push(BulkRejection {
                    index,
                    error: e.to_string(),
                }),
            }
        }
        debug!(
            scheduled = result.scheduled.len(),
            rejected = result.rejected.len(),
            "bulk schedule finished"
        );
        Ok(result)
    }

    /// Walk `[from, to]` at buffer granularity and return instants that
    /// are free of any conflict.
    pub async fn available_slots(
        &self,
        customer_id: &str,
        platform: Platform,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let step = self.config.buffer.max(Duration::minutes(1));
        let now = self.clock.now();
        let mut slots = Vec::new();
        let mut candidate = from;
        while candidate <= to && slots.len() < limit {
            if candidate > now {
                let conflicts = self
                    .conflicts_for(customer_id, platform, candidate, None)
                    .await?;
                if conflicts.is_empty() {
                    slots.push(candidate);
                }
            }
            candidate += step;
        }
        Ok(slots)
    }

    /// List a customer's tasks, newest-scheduled last, with optional
    /// status/platform/tag filtering.
    pub async fn list_tasks(
        &self,
        customer_id: &str,
        filter: TaskFilter,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let tasks = self.store.list_for_customer(customer_id, None).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.platform.is_none_or(|p| t.platform == p))
            .filter(|t| {
                filter
                    .tag
                    .as_ref()
                    .is_none_or(|tag| t.tags.iter().any(|have| have == tag))
            })
            .collect())
    }

    /// Aggregate statistics for one customer, optionally over a
    /// scheduled-time range.
    pub async fn statistics(
        &self,
        customer_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<ScheduleStatistics, SchedulerError> {
        let tasks = self.store.list_for_customer(customer_id, range).await?;
        let now = self.clock.now();

        let mut stats = ScheduleStatistics {
            total: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            *stats.by_status.entry(task.status).or_default() += 1;
            *stats.by_platform.entry(task.platform).or_default() += 1;
            if task.status == TaskStatus::Pending && task.scheduled_for > now {
                stats.upcoming += 1;
            }
            stats.total_attempts += task.attempts.len();
            stats.successful_attempts +=
                task.attempts.iter().filter(|a| a.result.success).count();
        }
        if stats.total_attempts > 0 {
            stats.success_rate = stats.successful_attempts as f64 / stats.total_attempts as f64;
        }
        Ok(stats)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, SchedulerError> {
        Ok(self.store.get(id).await?)
    }

    // ---- Worker-facing operations ----

    /// Due pending tasks in dispatch order.
    pub async fn due_tasks(&self, limit: usize) -> Result<Vec<ScheduledTask>, SchedulerError> {
        Ok(self.store.find_due(self.clock.now(), limit).await?)
    }

    /// Requeue failed tasks whose retry time has arrived. Returns how many
    /// moved back to pending; a lost race with another worker is not an
    /// error.
    pub async fn promote_due_retries(&self, limit: usize) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let due = self.store.find_due_retries(now, limit).await?;
        let mut promoted = 0;
        for task in due {
            let updated = match lifecycle::retry(&task, now) {
                Ok(updated) => updated,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "skipping unretryable task");
                    continue;
                }
            };
            match self.store.transition(updated, TaskStatus::Failed).await {
                Ok(_) => promoted += 1,
                Err(StoreError::StatusConflict { .. }) => {
                    debug!(task_id = %task.id, "another worker promoted this retry");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to promote retry"),
            }
        }
        Ok(promoted)
    }

    /// Claim a due task for execution: `pending -> running` through the
    /// store CAS. Losing the race surfaces as a `StatusConflict`.
    pub async fn mark_dispatched(
        &self,
        task: &ScheduledTask,
    ) -> Result<ScheduledTask, SchedulerError> {
        let updated = lifecycle::dispatch(task, self.clock.now())?;
        Ok(self.store.transition(updated, TaskStatus::Pending).await?)
    }

    /// Feed an execution outcome back through the lifecycle and, when the
    /// task lands terminal, advance its recurrence.
    pub async fn record_execution(
        &self,
        task: &ScheduledTask,
        result: ExecutionResult,
    ) -> Result<ScheduledTask, SchedulerError> {
        let now = self.clock.now();
        let updated = if result.success {
            lifecycle::succeed(task, result, now)?
        } else {
            lifecycle::fail(task, result, now, &self.retry_policy)?
        };
        let stored = self.store.transition(updated, TaskStatus::Running).await?;

        // Execution-final outcomes advance the recurrence: completed,
        // retries exhausted, or a non-retryable failure. One occurrence's
        // fate never silently kills the series; only cancelling the
        // pending instance (or the template) stops it.
        let finished = stored.status.is_terminal()
            || (stored.status == TaskStatus::Failed && stored.next_retry_at.is_none());
        if finished {
            if let Err(e) = self.advance_recurrence(&stored).await {
                // The execution outcome is already recorded; a recurrence
                // failure must not undo it.
                warn!(task_id = %stored.id, error = %e, "failed to advance recurrence");
            }
        }
        Ok(stored)
    }

    /// Dispatch-time admission check; mutating.
    pub fn admit(&self, customer_id: &str, platform: Platform, at: DateTime<Utc>) -> Admission {
        self.limiter.admit(customer_id, platform, at)
    }

    // ---- Internal ----

    fn validate(&self, request: &ScheduleRequest, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if request.scheduled_for <= now {
            return Err(SchedulerError::Validation(
                "scheduled time is in the past".into(),
            ));
        }
        if request.entity_id.trim().is_empty() {
            return Err(SchedulerError::Validation("entity id is empty".into()));
        }
        if request.customer_id.trim().is_empty() {
            return Err(SchedulerError::Validation("customer id is empty".into()));
        }
        if let Some(pattern) = &request.recurrence {
            RecurrenceExpander::validate(pattern)?;
        }
        Ok(())
    }

    /// Buffer/min-interval conflicts from the detector plus a read-only
    /// rate-limit probe; the two checks are independent and must both
    /// pass.
    async fn conflicts_for(
        &self,
        customer_id: &str,
        platform: Platform,
        at: DateTime<Utc>,
        exclude: Option<TaskId>,
    ) -> Result<Vec<ScheduleConflict>, SchedulerError> {
        let mut conflicts = self
            .detector
            .find_conflicts(customer_id, platform, at, exclude)
            .await?;

        let admission = self.limiter.check(customer_id, platform, at);
        if !admission.admitted {
            conflicts.push(ScheduleConflict {
                conflicting_task: None,
                kind: ConflictKind::RateLimit,
                severity: ConflictSeverity::Blocking,
                suggested_time: admission.retry_after,
                message: format!("rate limit for {platform} reached around this time"),
            });
        }
        Ok(conflicts)
    }

    async fn require(&self, id: TaskId) -> Result<ScheduledTask, SchedulerError> {
        self.store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Spawn the next occurrence after a terminal instance. The series
    /// stops when the template was cancelled by a caller (retry
    /// exhaustion does not count) or the pattern has run out.
    async fn advance_recurrence(
        &self,
        task: &ScheduledTask,
    ) -> Result<Option<ScheduledTask>, SchedulerError> {
        let template = if task.is_template() {
            task.clone()
        } else if let Some(parent) = task.parent_schedule_id {
            match self.store.get(parent).await? {
                Some(template) => template,
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };
        let Some(pattern) = template.recurrence.clone() else {
            return Ok(None);
        };

        let user_cancelled = template.status == TaskStatus::Cancelled
            && template.cancel_reason.as_deref() != Some(lifecycle::RETRIES_EXHAUSTED);
        if user_cancelled {
            debug!(template = %template.id, "template cancelled, recurrence stopped");
            return Ok(None);
        }

        let occurrences = 1 + self.store.count_instances(template.id).await? as u32;
        let Some(next_at) =
            RecurrenceExpander::next_occurrence(&pattern, task.scheduled_for, occurrences)?
        else {
            info!(template = %template.id, occurrences, "recurrence complete");
            return Ok(None);
        };

        let mut instance = ScheduledTask::new(
            template.customer_id.clone(),
            template.platform,
            template.entity_kind,
            template.entity_id.clone(),
            next_at,
            template.max_retries,
            self.clock.now(),
        );
        instance.priority = template.priority;
        instance.parent_schedule_id = Some(template.id);
        instance.tags = template.tags.clone();
        instance.notes = template.notes.clone();
        instance.created_by = template.created_by.clone();

        self.store.create(instance.clone()).await?;
        info!(
            template = %template.id,
            instance = %instance.id,
            scheduled_for = %next_at,
            "spawned next occurrence"
        );
        Ok(Some(instance))
    }
}
