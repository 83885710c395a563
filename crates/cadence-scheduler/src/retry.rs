//! Retry backoff policy.

use chrono::Duration;

use crate::config::SchedulerConfig;

/// Ceiling on any single retry delay (1 hour).
const MAX_BACKOFF_SECS: i64 = 3600;

/// Computes the delay before a failed task's next attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    exponential: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, exponential: bool) -> Self {
        Self {
            base_delay,
            exponential,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.retry_base_delay, config.exponential_backoff)
    }

    /// Delay before the attempt following `retry_count` prior failures:
    /// the base delay (fixed mode) or `base * 2^retry_count` capped at
    /// one hour (exponential mode).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if !self.exponential {
            return self.base_delay;
        }
        let factor: i64 = 1 << retry_count.min(5);
        let secs = self.base_delay.num_seconds().saturating_mul(factor);
        Duration::seconds(secs.min(MAX_BACKOFF_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_policy_ignores_retry_count() {
        let policy = RetryPolicy::new(Duration::minutes(15), false);
        assert_eq!(policy.backoff(0).num_minutes(), 15);
        assert_eq!(policy.backoff(5).num_minutes(), 15);
    }

    #[test]
    fn exponential_policy_doubles_then_caps() {
        let policy = RetryPolicy::new(Duration::minutes(5), true);
        assert_eq!(policy.backoff(0).num_seconds(), 300);
        assert_eq!(policy.backoff(1).num_seconds(), 600);
        assert_eq!(policy.backoff(2).num_seconds(), 1200);
        assert_eq!(policy.backoff(3).num_seconds(), 2400);
        assert_eq!(policy.backoff(4).num_seconds(), 3600); // capped
        assert_eq!(policy.backoff(20).num_seconds(), 3600);
    }

    proptest! {
        // Delay is always positive and never exceeds the cap.
        #[test]
        fn backoff_is_bounded(retry_count in 0u32..100, base_mins in 1i64..120) {
            let policy = RetryPolicy::new(Duration::minutes(base_mins), true);
            let delay = policy.backoff(retry_count);

            prop_assert!(delay >= Duration::minutes(base_mins.min(60)));
            prop_assert!(delay <= Duration::seconds(MAX_BACKOFF_SECS).max(Duration::minutes(base_mins)));
        }

        // More failures never shorten the delay.
        #[test]
        fn backoff_non_decreasing(a in 0u32..20, b in 0u32..20) {
            let policy = RetryPolicy::new(Duration::minutes(5), true);
            if a <= b {
                prop_assert!(policy.backoff(a) <= policy.backoff(b));
            }
        }
    }
}
