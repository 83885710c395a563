//! Conflict detection for proposed schedule times.
//!
//! Read-only: the detector reports what is wrong with a proposed time and
//! suggests an alternative; callers decide whether to proceed with `force`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use cadence_store::{Platform, ScheduleStore, TaskId};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Why a proposed time collides with existing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Another task is scheduled at the exact same instant.
    SameTime,
    /// Another task falls within the scheduling buffer.
    BufferViolation,
    /// The platform rate limit would reject execution around this time.
    RateLimit,
    /// Another task is within the platform's minimum interval.
    PlatformLimit,
}

/// Whether a conflict blocks scheduling or is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Warning,
    Blocking,
}

/// A transient description of why a proposed time is invalid.
///
/// Produced on demand; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleConflict {
    /// The colliding task, when the conflict is with a specific task.
    pub conflicting_task: Option<TaskId>,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    /// Nearest free slot the caller could use instead.
    pub suggested_time: Option<DateTime<Utc>>,
    pub message: String,
}

impl ScheduleConflict {
    pub fn is_blocking(&self) -> bool {
        self.severity == ConflictSeverity::Blocking
    }
}

/// Scans existing schedules for collisions with a proposed time.
pub struct ConflictDetector {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
}

impl ConflictDetector {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Find every task for the same customer and platform whose scheduled
    /// time falls within the buffer of `proposed`. `exclude` skips one id,
    /// used when re-checking a reschedule of the same task.
    pub async fn find_conflicts(
        &self,
        customer_id: &str,
        platform: Platform,
        proposed: DateTime<Utc>,
        exclude: Option<TaskId>,
    ) -> Result<Vec<ScheduleConflict>, SchedulerError> {
        let buffer = self.config.buffer;
        let min_interval = self.config.limits_for(platform).min_interval;
        // The scan must cover whichever constraint reaches further.
        let span = buffer.max(min_interval);
        let neighbors = self
            .store
            .find_in_window(customer_id, platform, proposed - span, proposed + span, exclude)
            .await?;
        let suggested = self.suggest_slot(proposed);

        let conflicts = neighbors
            .into_iter()
            .filter_map(|existing| {
                let gap = (existing.scheduled_for - proposed).abs();
                // A full buffer of spacing is conflict-free; the window
                // query is inclusive at its edges.
                if !gap.is_zero() && gap >= buffer && gap >= min_interval {
                    return None;
                }
                let (kind, severity, message) = if gap.is_zero() {
                    (
                        ConflictKind::SameTime,
                        ConflictSeverity::Blocking,
                        format!("task {} is already scheduled at this exact time", existing.id),
                    )
                } else if gap < min_interval {
                    (
                        ConflictKind::PlatformLimit,
                        ConflictSeverity::Blocking,
                        format!(
                            "task {} is {}m away, inside the {}m minimum interval for {}",
                            existing.id,
                            gap.num_minutes(),
                            min_interval.num_minutes(),
                            platform,
                        ),
                    )
                } else {
                    (
                        ConflictKind::BufferViolation,
                        ConflictSeverity::Warning,
                        format!(
                            "task {} is {}m away, inside the {}m scheduling buffer",
                            existing.id,
                            gap.num_minutes(),
                            buffer.num_minutes(),
                        ),
                    )
                };
                Some(ScheduleConflict {
                    conflicting_task: Some(existing.id),
                    kind,
                    severity,
                    suggested_time: Some(suggested),
                    message,
                })
            })
            .collect();

        Ok(conflicts)
    }

    /// Nearest alternative slot: one buffer earlier when that is still in
    /// the future, otherwise one buffer later.
    fn suggest_slot(&self, proposed: DateTime<Utc>) -> DateTime<Utc> {
        let earlier = proposed - self.config.buffer;
        if earlier > self.clock.now() {
            earlier
        } else {
            proposed + self.config.buffer
        }
    }
}
