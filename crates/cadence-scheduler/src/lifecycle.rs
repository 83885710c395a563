//! Task lifecycle state machine.
//!
//! Pure transition functions: current task in, updated task out, no I/O.
//! The store's compare-and-swap applies the returned value against the
//! prior status, so an invalid or raced transition never mutates anything.
//!
//! ```text
//! pending ──dispatch──> running ──succeed──> completed
//!    │ ▲                   │
//!    │ │                   └──fail──> failed ──retry──> pending
//!    │ │                                │
//! pause resume                          └── (exhausted) ──> cancelled
//!    ▼ │
//!  paused
//! ```
//!
//! `cancelled` is reachable from pending, paused, and failed; never from
//! running or a terminal state.

use chrono::{DateTime, Duration, Utc};

use cadence_store::{ExecutionRecord, ExecutionResult, ScheduledTask, TaskStatus};

use crate::error::SchedulerError;
use crate::retry::RetryPolicy;

/// Cancel reason recorded when a task runs out of retries.
pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

/// `pending -> running`, guarded on the task being due.
pub fn dispatch(task: &ScheduledTask, now: DateTime<Utc>) -> Result<ScheduledTask, SchedulerError> {
    if task.status != TaskStatus::Pending {
        return Err(invalid(task, "dispatch"));
    }
    if task.scheduled_for > now {
        return Err(SchedulerError::Validation(format!(
            "task {} is not due until {}",
            task.id, task.scheduled_for
        )));
    }

    let mut updated = task.clone();
    updated.status = TaskStatus::Running;
    updated.updated_at = now;
    Ok(updated)
}

/// `running -> completed`, recording the successful attempt.
pub fn succeed(
    task: &ScheduledTask,
    result: ExecutionResult,
    now: DateTime<Utc>,
) -> Result<ScheduledTask, SchedulerError> {
    if task.status != TaskStatus::Running {
        return Err(invalid(task, "succeed"));
    }

    let mut updated = task.clone();
    push_attempt(&mut updated, result, now);
    updated.status = TaskStatus::Completed;
    updated.executed_at = Some(now);
    updated.next_retry_at = None;
    updated.updated_at = now;
    Ok(updated)
}

/// `running -> failed` (with a retry scheduled), `running -> failed`
/// terminal (non-retryable error), or `running -> cancelled` (retries
/// exhausted).
pub fn fail(
    task: &ScheduledTask,
    result: ExecutionResult,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Result<ScheduledTask, SchedulerError> {
    if task.status != TaskStatus::Running {
        return Err(invalid(task, "fail"));
    }

    let retryable = result.is_retryable();
    let mut updated = task.clone();
    push_attempt(&mut updated, result, now);
    updated.updated_at = now;

    if !retryable {
        updated.status = TaskStatus::Failed;
        updated.next_retry_at = None;
        updated.executed_at = Some(now);
        return Ok(updated);
    }

    // Backoff grows with the failures that came before this one.
    let prior_failures = updated.retry_count;
    if updated.retry_count < updated.max_retries {
        updated.retry_count += 1;
    }

    if updated.retry_count >= updated.max_retries {
        updated.status = TaskStatus::Cancelled;
        updated.cancel_reason = Some(RETRIES_EXHAUSTED.to_string());
        updated.next_retry_at = None;
    } else {
        updated.status = TaskStatus::Failed;
        updated.next_retry_at = Some(now + policy.backoff(prior_failures));
    }
    Ok(updated)
}

/// `failed -> pending`, once the scheduled retry time has arrived.
pub fn retry(task: &ScheduledTask, now: DateTime<Utc>) -> Result<ScheduledTask, SchedulerError> {
    if task.status != TaskStatus::Failed || task.next_retry_at.is_none() {
        return Err(invalid(task, "retry"));
    }

    let mut updated = task.clone();
    updated.status = TaskStatus::Pending;
    updated.next_retry_at = None;
    updated.updated_at = now;
    Ok(updated)
}

/// `pending | paused | failed -> cancelled`. Running tasks cannot be
/// cancelled; terminal tasks report `AlreadyTerminal`.
pub fn cancel(
    task: &ScheduledTask,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<ScheduledTask, SchedulerError> {
    if task.status.is_terminal() {
        return Err(SchedulerError::AlreadyTerminal(task.status));
    }
    if task.status == TaskStatus::Running {
        return Err(invalid(task, "cancel"));
    }

    let mut updated = task.clone();
    updated.status = TaskStatus::Cancelled;
    updated.cancel_reason = Some(reason.unwrap_or_else(|| "cancelled".to_string()));
    updated.next_retry_at = None;
    updated.updated_at = now;
    Ok(updated)
}

/// `pending -> paused`.
pub fn pause(task: &ScheduledTask, now: DateTime<Utc>) -> Result<ScheduledTask, SchedulerError> {
    if task.status != TaskStatus::Pending {
        return Err(invalid(task, "pause"));
    }

    let mut updated = task.clone();
    updated.status = TaskStatus::Paused;
    updated.updated_at = now;
    Ok(updated)
}

/// `paused -> pending`. A new time is required when the original
/// `scheduled_for` has already passed.
pub fn resume(
    task: &ScheduledTask,
    new_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<ScheduledTask, SchedulerError> {
    if task.status != TaskStatus::Paused {
        return Err(invalid(task, "resume"));
    }

    let mut updated = task.clone();
    match new_time {
        Some(at) => {
            if at <= now {
                return Err(SchedulerError::Validation(
                    "new scheduled time is in the past".into(),
                ));
            }
            updated.scheduled_for = at;
        }
        None => {
            if task.scheduled_for <= now {
                return Err(SchedulerError::TimePassed);
            }
        }
    }
    updated.status = TaskStatus::Pending;
    updated.updated_at = now;
    Ok(updated)
}

/// `pending | paused` keep their status but move to a new time. A
/// controlled transition, not a silent mutation: the caller re-checks
/// conflicts first and the store applies it via compare-and-swap.
pub fn reschedule(
    task: &ScheduledTask,
    new_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ScheduledTask, SchedulerError> {
    if !matches!(task.status, TaskStatus::Pending | TaskStatus::Paused) {
        return Err(invalid(task, "reschedule"));
    }
    if new_time <= now {
        return Err(SchedulerError::Validation(
            "new scheduled time is in the past".into(),
        ));
    }

    let mut updated = task.clone();
    updated.scheduled_for = new_time;
    updated.updated_at = now;
    Ok(updated)
}

fn invalid(task: &ScheduledTask, event: &'static str) -> SchedulerError {
    if task.status.is_terminal() {
        SchedulerError::AlreadyTerminal(task.status)
    } else {
        SchedulerError::InvalidTransition {
            from: task.status,
            event,
        }
    }
}

fn push_attempt(task: &mut ScheduledTask, result: ExecutionResult, now: DateTime<Utc>) {
    let started_at = now - Duration::milliseconds(result.duration_ms as i64);
    task.attempts.push(ExecutionRecord {
        attempt: task.retry_count + 1,
        started_at,
        result,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_store::{EntityKind, Platform};
    use test_case::test_case;

    fn task_with_status(status: TaskStatus, now: DateTime<Utc>) -> ScheduledTask {
        let mut task = ScheduledTask::new(
            "cust-1",
            Platform::Reddit,
            EntityKind::RedditPost,
            "post-1",
            now - Duration::minutes(1),
            3,
            now,
        );
        task.status = status;
        task
    }

    fn fixed_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::minutes(15), false)
    }

    #[test]
    fn dispatch_moves_due_pending_to_running() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Pending, now);

        let running = dispatch(&task, now).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
    }

    #[test]
    fn dispatch_rejects_not_yet_due() {
        let now = Utc::now();
        let mut task = task_with_status(TaskStatus::Pending, now);
        task.scheduled_for = now + Duration::hours(1);

        assert!(matches!(
            dispatch(&task, now),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test_case(TaskStatus::Running; "running")]
    #[test_case(TaskStatus::Paused; "paused")]
    #[test_case(TaskStatus::Failed; "failed")]
    #[test_case(TaskStatus::Completed; "completed")]
    #[test_case(TaskStatus::Cancelled; "cancelled")]
    fn dispatch_rejects_non_pending(status: TaskStatus) {
        let now = Utc::now();
        let task = task_with_status(status, now);
        assert!(dispatch(&task, now).is_err());
    }

    #[test]
    fn succeed_records_attempt_and_completes() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Running, now);

        let done = succeed(&task, ExecutionResult::success(250), now).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.executed_at, Some(now));
        assert_eq!(done.attempts.len(), 1);
        assert_eq!(done.attempts[0].attempt, 1);
        assert!(done.next_retry_at.is_none());
    }

    #[test]
    fn retryable_failure_schedules_retry_with_backoff() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Running, now);

        let failed = fail(
            &task,
            ExecutionResult::failure("api_error", "503", true, 100),
            now,
            &fixed_policy(),
        )
        .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.next_retry_at, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn third_retryable_failure_exhausts_and_cancels() {
        let now = Utc::now();
        let policy = fixed_policy();
        let mut task = task_with_status(TaskStatus::Running, now);

        for attempt in 1..=3u32 {
            let outcome = fail(
                &task,
                ExecutionResult::failure("api_error", "503", true, 100),
                now,
                &policy,
            )
            .unwrap();
            assert_eq!(outcome.retry_count, attempt);
            assert!(outcome.retry_count <= outcome.max_retries);

            if attempt < 3 {
                assert_eq!(outcome.status, TaskStatus::Failed);
                assert!(outcome.next_retry_at.is_some());
                // Re-run the attempt: retry then dispatch again.
                let mut requeued = retry(&outcome, now).unwrap();
                requeued.status = TaskStatus::Running;
                task = requeued;
            } else {
                assert_eq!(outcome.status, TaskStatus::Cancelled);
                assert_eq!(outcome.cancel_reason.as_deref(), Some(RETRIES_EXHAUSTED));
                assert!(outcome.next_retry_at.is_none());
            }
        }
    }

    #[test]
    fn non_retryable_failure_terminates_without_retry() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Running, now);

        let failed = fail(
            &task,
            ExecutionResult::failure("invalid_entity", "gone", false, 100),
            now,
            &fixed_policy(),
        )
        .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.next_retry_at.is_none());
        assert_eq!(failed.executed_at, Some(now));
    }

    #[test]
    fn zero_retry_budget_exhausts_on_first_failure() {
        let now = Utc::now();
        let mut task = task_with_status(TaskStatus::Running, now);
        task.max_retries = 0;

        let outcome = fail(
            &task,
            ExecutionResult::failure("api_error", "503", true, 100),
            now,
            &fixed_policy(),
        )
        .unwrap();
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.retry_count, 0);
    }

    #[test]
    fn retry_requeues_failed_task() {
        let now = Utc::now();
        let mut task = task_with_status(TaskStatus::Failed, now);
        task.next_retry_at = Some(now - Duration::seconds(1));

        let pending = retry(&task, now).unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert!(pending.next_retry_at.is_none());
    }

    #[test]
    fn retry_rejects_parked_failures() {
        // A non-retryable failure leaves no next_retry_at; it must stay put.
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Failed, now);
        assert!(retry(&task, now).is_err());
    }

    #[test_case(TaskStatus::Pending; "pending")]
    #[test_case(TaskStatus::Paused; "paused")]
    #[test_case(TaskStatus::Failed; "failed")]
    fn cancel_allowed_from(status: TaskStatus) {
        let now = Utc::now();
        let task = task_with_status(status, now);

        let cancelled = cancel(&task, Some("operator request".into()), now).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("operator request"));
    }

    #[test]
    fn cancel_rejects_running() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Running, now);
        assert!(matches!(
            cancel(&task, None, now),
            Err(SchedulerError::InvalidTransition { .. })
        ));
    }

    #[test_case(TaskStatus::Completed; "completed")]
    #[test_case(TaskStatus::Cancelled; "cancelled")]
    fn cancel_twice_is_a_terminal_noop_error(status: TaskStatus) {
        let now = Utc::now();
        let task = task_with_status(status, now);
        assert!(matches!(
            cancel(&task, None, now),
            Err(SchedulerError::AlreadyTerminal(_))
        ));
    }

    #[test]
    fn pause_and_resume_roundtrip() {
        let now = Utc::now();
        let mut task = task_with_status(TaskStatus::Pending, now);
        task.scheduled_for = now + Duration::hours(1);

        let paused = pause(&task, now).unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);

        let resumed = resume(&paused, None, now).unwrap();
        assert_eq!(resumed.status, TaskStatus::Pending);
        assert_eq!(resumed.scheduled_for, task.scheduled_for);
    }

    #[test]
    fn resume_past_due_requires_new_time() {
        let now = Utc::now();
        let mut task = task_with_status(TaskStatus::Paused, now);
        task.scheduled_for = now - Duration::hours(1);

        assert!(matches!(
            resume(&task, None, now),
            Err(SchedulerError::TimePassed)
        ));

        let new_time = now + Duration::hours(2);
        let resumed = resume(&task, Some(new_time), now).unwrap();
        assert_eq!(resumed.status, TaskStatus::Pending);
        assert_eq!(resumed.scheduled_for, new_time);
    }

    #[test]
    fn resume_rejects_past_new_time() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Paused, now);
        assert!(matches!(
            resume(&task, Some(now - Duration::minutes(5)), now),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn reschedule_moves_pending_task() {
        let now = Utc::now();
        let task = task_with_status(TaskStatus::Pending, now);
        let new_time = now + Duration::hours(3);

        let moved = reschedule(&task, new_time, now).unwrap();
        assert_eq!(moved.scheduled_for, new_time);
        assert_eq!(moved.status, TaskStatus::Pending);
    }

    #[test_case(TaskStatus::Running; "running")]
    #[test_case(TaskStatus::Completed; "completed")]
    #[test_case(TaskStatus::Failed; "failed")]
    fn reschedule_rejects_non_schedulable(status: TaskStatus) {
        let now = Utc::now();
        let task = task_with_status(status, now);
        assert!(reschedule(&task, now + Duration::hours(1), now).is_err());
    }
}
