//! Scheduling core for Cadence.
//!
//! Decides *when* a unit of content-distribution work executes:
//! - Conflict detection against scheduling buffers and platform minimum
//!   intervals
//! - Per-customer, per-platform rate-limit admission with sliding windows
//! - Recurrence expansion (daily/weekly/monthly, timezone-aware)
//! - Bounded retry with fixed or exponential backoff
//! - A status state machine applied through the store's compare-and-swap
//! - A polling worker loop with bounded parallelism and per-key ordering
//!
//! Actual platform calls are delegated to [`ExecutionHandler`]
//! implementations registered with the worker; transport surfaces live
//! outside this crate.

mod clock;
mod config;
mod conflict;
mod error;
mod lifecycle;
mod rate_limit;
mod recurrence;
mod retry;
mod scheduler;
mod worker;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{PlatformLimits, SchedulerConfig};
pub use conflict::{ConflictDetector, ConflictKind, ConflictSeverity, ScheduleConflict};
pub use error::SchedulerError;
pub use lifecycle::RETRIES_EXHAUSTED;
pub use rate_limit::{Admission, RateLimiter};
pub use recurrence::RecurrenceExpander;
pub use retry::RetryPolicy;
pub use scheduler::{
    BulkRejection, BulkScheduleResult, DistributionStrategy, ScheduleRequest, ScheduleStatistics,
    Scheduler, TaskFilter,
};
pub use worker::{ExecutionHandler, WorkerLoop};
