//! Per-customer, per-platform admission control.
//!
//! Rolling hour/day counters plus minimum spacing, keyed by
//! (customer, platform). The check and the counter increment happen under
//! the key's map entry guard, so concurrently racing workers cannot
//! over-admit. Windows slide implicitly; there is no reset operation.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use cadence_store::Platform;

use crate::config::{PlatformLimits, SchedulerConfig};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Earliest instant at which admission would succeed, on rejection.
    pub retry_after: Option<DateTime<Utc>>,
}

impl Admission {
    fn granted() -> Self {
        Self {
            admitted: true,
            retry_after: None,
        }
    }

    fn denied(retry_after: DateTime<Utc>) -> Self {
        Self {
            admitted: false,
            retry_after: Some(retry_after),
        }
    }
}

/// Sliding admission history for one (customer, platform) key, oldest
/// first.
#[derive(Debug, Default)]
struct Window {
    admissions: VecDeque<DateTime<Utc>>,
}

/// Admits or rejects execution attempts against per-platform ceilings.
pub struct RateLimiter {
    config: Arc<SchedulerConfig>,
    windows: DashMap<(String, Platform), Window>,
}

impl RateLimiter {
    pub fn new(config: Arc<SchedulerConfig>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Mutating admission check used at dispatch time: on success the
    /// attempt is recorded against the key's windows. The prune, the
    /// check, and the increment all run under the key's entry guard.
    pub fn admit(&self, customer_id: &str, platform: Platform, at: DateTime<Utc>) -> Admission {
        let limits = self.config.limits_for(platform);
        let mut window = self
            .windows
            .entry((customer_id.to_string(), platform))
            .or_default();

        // Entries a full day behind `at` can never matter again; dispatch
        // times are monotonic enough that pruning here keeps the deque
        // bounded.
        let day_ago = at - Duration::days(1);
        while window.admissions.front().is_some_and(|t| *t <= day_ago) {
            window.admissions.pop_front();
        }

        let decision = Self::evaluate(&window, &limits, at);
        if decision.admitted {
            window.admissions.push_back(at);
        }
        decision
    }

    /// Read-only probe used at scheduling time; consumes no capacity and
    /// mutates nothing (the probed instant may be far in the future).
    pub fn check(&self, customer_id: &str, platform: Platform, at: DateTime<Utc>) -> Admission {
        let limits = self.config.limits_for(platform);
        match self.windows.get(&(customer_id.to_string(), platform)) {
            Some(window) => Self::evaluate(&window, &limits, at),
            None => Admission::granted(),
        }
    }

    /// Check all three ceilings against the recorded admissions.
    fn evaluate(window: &Window, limits: &PlatformLimits, at: DateTime<Utc>) -> Admission {
        let mut admitted = true;
        let mut retry_after = at;

        // Rolling day ceiling. Admissions are ordered, so the in-window
        // entries form a suffix of the deque.
        let day_ago = at - Duration::days(1);
        let day_count = window.admissions.iter().filter(|t| **t > day_ago).count();
        if day_count >= limits.max_per_day as usize {
            admitted = false;
            let first_in_day = window.admissions.len() - day_count;
            let expiring_idx = first_in_day + (day_count - limits.max_per_day as usize);
            if let Some(expiring) = window.admissions.get(expiring_idx) {
                retry_after = retry_after.max(*expiring + Duration::days(1));
            }
        }

        // Rolling hour ceiling.
        let hour_ago = at - Duration::hours(1);
        let hour_count = window.admissions.iter().filter(|t| **t > hour_ago).count();
        if hour_count >= limits.max_per_hour as usize {
            admitted = false;
            let first_in_hour = window.admissions.len() - hour_count;
            let expiring_idx = first_in_hour + (hour_count - limits.max_per_hour as usize);
            if let Some(expiring) = window.admissions.get(expiring_idx) {
                retry_after = retry_after.max(*expiring + Duration::hours(1));
            }
        }

        // Minimum spacing since the most recent admission.
        if let Some(last) = window.admissions.back()
            && at - *last < limits.min_interval
        {
            admitted = false;
            retry_after = retry_after.max(*last + limits.min_interval);
        }

        if admitted {
            Admission::granted()
        } else {
            Admission::denied(retry_after)
        }
    }
}
