//! The polling worker loop.
//!
//! Polls the store for due work on an interval, claims each task through
//! the compare-and-swap dispatch, and runs the handler registered for its
//! entity kind under a bounded timeout. Parallelism is capped by a
//! semaphore; tasks sharing a (customer, platform) key are serialized
//! relative to each other so rate-limiter ordering holds, while tasks on
//! different keys run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use cadence_store::{EntityKind, ExecutionResult, Platform, ScheduledTask, StoreError};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::scheduler::Scheduler;

/// Executes the platform-specific action when a task fires.
///
/// One implementation per entity kind, registered at startup. A handler
/// is invoked at most once per dispatch and must return within the
/// configured task timeout; the worker treats an overrun as a retryable
/// failure.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(&self, entity_id: &str) -> ExecutionResult;
}

/// Serialization key: work for the same customer and platform never runs
/// concurrently.
type LaneKey = (String, Platform);

/// Polls for due tasks and drives them through their handlers.
pub struct WorkerLoop {
    scheduler: Arc<Scheduler>,
    config: Arc<SchedulerConfig>,
    handlers: HashMap<EntityKind, Arc<dyn ExecutionHandler>>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<LaneKey>>>,
}

impl WorkerLoop {
    pub fn new(scheduler: Arc<Scheduler>, config: Arc<SchedulerConfig>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            scheduler,
            config,
            handlers: HashMap::new(),
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register the handler for one entity kind. Later registrations for
    /// the same kind replace earlier ones.
    pub fn register_handler(&mut self, kind: EntityKind, handler: Arc<dyn ExecutionHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Run until the shutdown signal flips. A failed poll logs and waits
    /// for the next interval; it never crashes the loop.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent = self.config.max_concurrent_tasks,
            "worker loop starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.tick().await {
                Ok(0) => {}
                Ok(dispatched) => debug!(dispatched, "dispatched due tasks"),
                Err(e) => warn!(error = %e, "worker tick failed"),
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("worker received shutdown signal");
                    }
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        // Wait for in-flight executions before returning.
        let _ = self
            .permits
            .acquire_many(self.config.max_concurrent_tasks as u32)
            .await;
        info!("worker loop stopped");
    }

    /// One poll cycle: promote due retries, then claim and launch due
    /// tasks. Returns how many executions were started.
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        let batch = self.config.max_concurrent_tasks * 4;

        let promoted = self.scheduler.promote_due_retries(batch).await?;
        if promoted > 0 {
            debug!(promoted, "requeued failed tasks for retry");
        }

        let due = self.scheduler.due_tasks(batch).await?;
        let mut started = 0;
        for task in due {
            let key: LaneKey = (task.customer_id.clone(), task.platform);

            {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains(&key) {
                    // Same customer+platform already executing; keep
                    // scheduled order by waiting for the next poll.
                    continue;
                }

                let admission =
                    self.scheduler
                        .admit(&task.customer_id, task.platform, self.scheduler.now());
                if !admission.admitted {
                    debug!(
                        task_id = %task.id,
                        retry_after = ?admission.retry_after,
                        "rate limited, deferring dispatch"
                    );
                    continue;
                }

                in_flight.insert(key.clone());
            }

            match self.scheduler.mark_dispatched(&task).await {
                Ok(running) => {
                    self.launch(running, key).await;
                    started += 1;
                }
                Err(SchedulerError::Store(StoreError::StatusConflict { .. })) => {
                    debug!(task_id = %task.id, "lost dispatch race");
                    self.in_flight.lock().await.remove(&key);
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "dispatch failed");
                    self.in_flight.lock().await.remove(&key);
                }
            }
        }
        Ok(started)
    }

    /// Hand a claimed task to the bounded executor pool.
    async fn launch(&self, task: ScheduledTask, key: LaneKey) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            // Closed semaphore means the loop is shutting down.
            Err(_) => {
                self.in_flight.lock().await.remove(&key);
                return;
            }
        };

        let scheduler = Arc::clone(&self.scheduler);
        let handler = self.handlers.get(&task.entity_kind).cloned();
        let in_flight = Arc::clone(&self.in_flight);
        let task_timeout = self.config.task_timeout;

        tokio::spawn(async move {
            let _permit = permit;

            let result = match handler {
                Some(handler) => Self::execute_with_timeout(&handler, &task, task_timeout).await,
                None => {
                    error!(
                        task_id = %task.id,
                        entity_kind = %task.entity_kind,
                        "no handler registered"
                    );
                    ExecutionResult::failure(
                        "no_handler",
                        format!("no handler registered for {}", task.entity_kind),
                        false,
                        0,
                    )
                }
            };

            match scheduler.record_execution(&task, result).await {
                Ok(stored) => {
                    debug!(task_id = %stored.id, status = %stored.status, "execution recorded");
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "failed to record execution result");
                }
            }

            in_flight.lock().await.remove(&key);
        });
    }

    async fn execute_with_timeout(
        handler: &Arc<dyn ExecutionHandler>,
        task: &ScheduledTask,
        limit: std::time::Duration,
    ) -> ExecutionResult {
        let started = std::time::Instant::now();
        debug!(task_id = %task.id, entity_id = %task.entity_id, "executing");

        match timeout(limit, handler.execute(&task.entity_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %task.id, timeout_ms = limit.as_millis() as u64, "handler timed out");
                ExecutionResult::failure(
                    "timeout",
                    format!("handler exceeded {}ms", limit.as_millis()),
                    true,
                    started.elapsed().as_millis() as u64,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::scheduler::ScheduleRequest;
    use cadence_store::{MemoryStore, Priority, ScheduleStore, TaskId, TaskStatus};
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that records invocations and returns a canned result.
    struct ScriptedHandler {
        calls: AtomicUsize,
        result: ExecutionResult,
    }

    impl ScriptedHandler {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: ExecutionResult::success(5),
            })
        }

        fn failing(retryable: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: ExecutionResult::failure("api_error", "503", retryable, 5),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutionHandler for ScriptedHandler {
        async fn execute(&self, _entity_id: &str) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    /// Handler that never returns within any reasonable timeout.
    struct HangingHandler;

    #[async_trait]
    impl ExecutionHandler for HangingHandler {
        async fn execute(&self, _entity_id: &str) -> ExecutionResult {
            sleep(std::time::Duration::from_secs(3600)).await;
            ExecutionResult::success(0)
        }
    }

    fn setup(
        config: SchedulerConfig,
    ) -> (Arc<FixedClock>, Arc<MemoryStore>, Arc<Scheduler>, WorkerLoop) {
        let clock = Arc::new(FixedClock::at(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(config);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store) as Arc<dyn ScheduleStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&config),
        ));
        let worker = WorkerLoop::new(Arc::clone(&scheduler), config);
        (clock, store, scheduler, worker)
    }

    async fn wait_for_status(
        store: &MemoryStore,
        id: TaskId,
        want: TaskStatus,
    ) -> ScheduledTask {
        for _ in 0..200 {
            if let Some(task) = store.get(id).await.unwrap()
                && task.status == want
            {
                return task;
            }
            sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached {want}");
    }

    /// Tick until at least one execution starts. The lane a finished task
    /// held is released slightly after its result becomes visible, so a
    /// single tick right after a completion can come up empty.
    async fn tick_until_started(worker: &WorkerLoop) {
        for _ in 0..200 {
            if worker.tick().await.unwrap() > 0 {
                return;
            }
            sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no execution started");
    }

    async fn schedule_due(
        scheduler: &Scheduler,
        clock: &FixedClock,
        entity_id: &str,
    ) -> ScheduledTask {
        let at = clock.now() + Duration::minutes(5);
        let (task, _) = scheduler
            .schedule(ScheduleRequest::new(
                "cust-1",
                Platform::Reddit,
                EntityKind::RedditPost,
                entity_id,
                at,
            ))
            .await
            .unwrap();
        clock.advance(Duration::minutes(10));
        task
    }

    #[tokio::test]
    async fn tick_runs_due_task_to_completion() {
        let (clock, store, scheduler, mut worker) = setup(SchedulerConfig::default());
        let handler = ScriptedHandler::succeeding();
        worker.register_handler(EntityKind::RedditPost, handler.clone());

        let task = schedule_due(&scheduler, &clock, "post-1").await;
        assert_eq!(worker.tick().await.unwrap(), 1);

        let done = wait_for_status(&store, task.id, TaskStatus::Completed).await;
        assert_eq!(handler.calls(), 1);
        assert_eq!(done.attempts.len(), 1);
        assert!(done.executed_at.is_some());
    }

    #[tokio::test]
    async fn missing_handler_fails_the_task_without_retry() {
        let (clock, store, scheduler, worker) = setup(SchedulerConfig::default());
        let task = schedule_due(&scheduler, &clock, "post-1").await;

        assert_eq!(worker.tick().await.unwrap(), 1);

        let failed = wait_for_status(&store, task.id, TaskStatus::Failed).await;
        assert!(failed.next_retry_at.is_none());
        assert_eq!(
            failed.attempts[0].result.error.as_ref().unwrap().code,
            "no_handler"
        );
    }

    #[tokio::test]
    async fn timeout_is_a_retryable_failure() {
        let config = SchedulerConfig {
            task_timeout: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        let (clock, store, scheduler, mut worker) = setup(config);
        worker.register_handler(EntityKind::RedditPost, Arc::new(HangingHandler));

        let task = schedule_due(&scheduler, &clock, "post-1").await;
        assert_eq!(worker.tick().await.unwrap(), 1);

        let failed = wait_for_status(&store, task.id, TaskStatus::Failed).await;
        let error = failed.attempts[0].result.error.as_ref().unwrap();
        assert_eq!(error.code, "timeout");
        assert!(error.retryable);
        assert!(failed.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_to_cancelled() {
        // Fixed 15-minute backoff, three attempts, then exhaustion.
        let config = SchedulerConfig {
            retry_base_delay: Duration::minutes(15),
            exponential_backoff: false,
            ..Default::default()
        };
        let (clock, store, scheduler, mut worker) = setup(config);
        let handler = ScriptedHandler::failing(true);
        worker.register_handler(EntityKind::RedditPost, handler.clone());

        let task = schedule_due(&scheduler, &clock, "post-1").await;

        for attempt in 1..=3u32 {
            tick_until_started(&worker).await;
            let failed = if attempt < 3 {
                let failed = wait_for_status(&store, task.id, TaskStatus::Failed).await;
                assert_eq!(
                    failed.next_retry_at,
                    Some(scheduler.now() + Duration::minutes(15))
                );
                failed
            } else {
                wait_for_status(&store, task.id, TaskStatus::Cancelled).await
            };
            assert_eq!(failed.retry_count, attempt);

            // Step past the backoff and the reddit min-interval so the
            // next attempt is both due and admitted.
            clock.advance(Duration::minutes(16));
        }

        let final_task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(final_task.status, TaskStatus::Cancelled);
        assert_eq!(final_task.cancel_reason.as_deref(), Some("retries exhausted"));
        assert!(final_task.next_retry_at.is_none());
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn same_customer_platform_is_serialized_per_tick() {
        let (clock, store, scheduler, mut worker) = setup(SchedulerConfig {
            // Effectively disable spacing so only lane serialization
            // limits this test.
            platform_limits: std::collections::HashMap::new(),
            buffer: Duration::minutes(0),
            ..Default::default()
        });
        let handler = ScriptedHandler::succeeding();
        worker.register_handler(EntityKind::RedditPost, handler.clone());

        // Two due tasks on the same (customer, platform) lane, sufficiently
        // spaced to clear the fallback min interval.
        let first = schedule_due(&scheduler, &clock, "post-1").await;
        clock.advance(Duration::minutes(30));
        let second = schedule_due(&scheduler, &clock, "post-2").await;

        // First tick launches only the earlier task.
        assert_eq!(worker.tick().await.unwrap(), 1);
        wait_for_status(&store, first.id, TaskStatus::Completed).await;
        let waiting = store.get(second.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, TaskStatus::Pending);

        // Clear the fallback 15m spacing, then the second goes.
        clock.advance(Duration::minutes(20));
        tick_until_started(&worker).await;
        wait_for_status(&store, second.id, TaskStatus::Completed).await;
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn different_priorities_break_same_instant_ties() {
        let (clock, store, scheduler, mut worker) = setup(SchedulerConfig::default());
        let handler = ScriptedHandler::succeeding();
        worker.register_handler(EntityKind::RedditPost, handler.clone());

        let at = clock.now() + Duration::minutes(5);
        let (low, _) = scheduler
            .schedule(
                ScheduleRequest::new(
                    "cust-1",
                    Platform::Reddit,
                    EntityKind::RedditPost,
                    "post-low",
                    at,
                )
                .with_priority(Priority::Low),
            )
            .await
            .unwrap();
        let (urgent, _) = scheduler
            .schedule(
                ScheduleRequest::new(
                    "cust-1",
                    Platform::Reddit,
                    EntityKind::RedditPost,
                    "post-urgent",
                    at,
                )
                .with_priority(Priority::Urgent)
                .with_force(),
            )
            .await
            .unwrap();
        clock.advance(Duration::minutes(10));

        // One lane, so a single tick takes the urgent task first.
        assert_eq!(worker.tick().await.unwrap(), 1);
        wait_for_status(&store, urgent.id, TaskStatus::Completed).await;
        assert_eq!(
            store.get(low.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }
}
