//! Daemon command: run the worker loop until interrupted.
//!
//! Wires an in-memory store, the scheduling core, and log-only
//! development handlers. Real deployments embed `cadence-scheduler` and
//! register handlers that actually talk to the platforms; this command
//! exists to run and observe the scheduling machinery locally.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Result;
use tokio::sync::watch;
use tracing::info;

use cadence_scheduler::{
    Clock, ExecutionHandler, Scheduler, SchedulerConfig, SystemClock, WorkerLoop,
};
use cadence_store::{EntityKind, ExecutionResult, MemoryStore, ScheduleStore};

/// Configuration for the daemon, assembled from CLI flags and env vars.
pub struct DaemonConfig {
    pub poll_interval: u64,
    pub max_concurrent: usize,
    pub task_timeout: u64,
    pub max_retries: u32,
    pub retry_base_delay: u64,
    pub exponential_backoff: bool,
    pub buffer_minutes: i64,
}

impl DaemonConfig {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: std::time::Duration::from_secs(self.poll_interval),
            max_concurrent_tasks: self.max_concurrent,
            task_timeout: std::time::Duration::from_secs(self.task_timeout),
            max_retries: self.max_retries,
            retry_base_delay: chrono::Duration::seconds(self.retry_base_delay as i64),
            exponential_backoff: self.exponential_backoff,
            buffer: chrono::Duration::minutes(self.buffer_minutes),
            ..Default::default()
        }
    }
}

/// Development handler: logs the dispatch and reports success without
/// touching any platform.
struct LogOnlyHandler {
    kind: EntityKind,
}

#[async_trait]
impl ExecutionHandler for LogOnlyHandler {
    async fn execute(&self, entity_id: &str) -> ExecutionResult {
        let started = std::time::Instant::now();
        info!(kind = %self.kind, entity_id, "dry-run execution");
        ExecutionResult::success(started.elapsed().as_millis() as u64)
    }
}

/// Run the daemon until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!("starting cadence daemon");

    let scheduler_config = Arc::new(config.scheduler_config());
    info!(
        poll_interval_secs = config.poll_interval,
        max_concurrent = config.max_concurrent,
        task_timeout_secs = config.task_timeout,
        max_retries = config.max_retries,
        exponential_backoff = config.exponential_backoff,
        buffer_minutes = config.buffer_minutes,
        "daemon configuration"
    );

    let store = Arc::new(MemoryStore::new()) as Arc<dyn ScheduleStore>;
    let clock = Arc::new(SystemClock) as Arc<dyn Clock>;
    let scheduler = Arc::new(Scheduler::new(store, clock, Arc::clone(&scheduler_config)));

    let mut worker = WorkerLoop::new(Arc::clone(&scheduler), scheduler_config);
    for kind in [
        EntityKind::RedditPost,
        EntityKind::Article,
        EntityKind::GenericTask,
    ] {
        worker.register_handler(kind, Arc::new(LogOnlyHandler { kind }));
    }

    // Shutdown on ctrl-c.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;

    info!("daemon shut down gracefully");
    Ok(())
}
