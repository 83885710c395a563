//! Scheduler configuration.
//!
//! One explicit configuration object, constructed at startup and passed
//! into the worker loop and rate limiter. There is no process-wide
//! default; embedders own the instance.

use chrono::Duration;
use std::collections::HashMap;

use cadence_store::Platform;

/// Per-platform throughput ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformLimits {
    /// Admissions allowed in any rolling 60-minute window.
    pub max_per_hour: u32,
    /// Admissions allowed in any rolling 24-hour window.
    pub max_per_day: u32,
    /// Minimum spacing between consecutive executions.
    pub min_interval: Duration,
}

/// Configuration for the scheduling core and worker loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the worker polls for due tasks.
    pub poll_interval: std::time::Duration,
    /// Upper bound on concurrently executing tasks.
    pub max_concurrent_tasks: usize,
    /// Per-task execution timeout; overruns fail as retryable.
    pub task_timeout: std::time::Duration,
    /// Default retry budget stamped onto new tasks.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_base_delay: Duration,
    /// Double the delay on each subsequent retry (capped) instead of
    /// using a fixed delay.
    pub exponential_backoff: bool,
    /// Minimum spacing enforced between same customer/platform tasks at
    /// scheduling time.
    pub buffer: Duration,
    /// Rate ceilings per platform.
    pub platform_limits: HashMap<Platform, PlatformLimits>,
}

impl SchedulerConfig {
    /// Limits for a platform, falling back to a conservative default for
    /// platforms missing from the table.
    pub fn limits_for(&self, platform: Platform) -> PlatformLimits {
        self.platform_limits
            .get(&platform)
            .copied()
            .unwrap_or(PlatformLimits {
                max_per_hour: 4,
                max_per_day: 20,
                min_interval: Duration::minutes(15),
            })
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let platform_limits = HashMap::from([
            (
                Platform::Reddit,
                PlatformLimits {
                    max_per_hour: 5,
                    max_per_day: 50,
                    min_interval: Duration::minutes(10),
                },
            ),
            (
                Platform::Quora,
                PlatformLimits {
                    max_per_hour: 10,
                    max_per_day: 80,
                    min_interval: Duration::minutes(5),
                },
            ),
            (
                Platform::Forum,
                PlatformLimits {
                    max_per_hour: 20,
                    max_per_day: 200,
                    min_interval: Duration::minutes(2),
                },
            ),
            (
                Platform::Linkedin,
                PlatformLimits {
                    max_per_hour: 4,
                    max_per_day: 20,
                    min_interval: Duration::minutes(30),
                },
            ),
        ]);

        Self {
            poll_interval: std::time::Duration::from_secs(10),
            max_concurrent_tasks: 4,
            task_timeout: std::time::Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::minutes(5),
            exponential_backoff: true,
            buffer: Duration::minutes(15),
            platform_limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_covers_every_platform() {
        let config = SchedulerConfig::default();
        for platform in Platform::ALL {
            assert!(config.platform_limits.contains_key(&platform));
        }
    }

    #[test]
    fn limits_for_unknown_platform_falls_back() {
        let config = SchedulerConfig {
            platform_limits: HashMap::new(),
            ..Default::default()
        };
        let limits = config.limits_for(Platform::Reddit);
        assert!(limits.max_per_hour > 0);
        assert!(limits.max_per_day >= limits.max_per_hour);
    }
}
