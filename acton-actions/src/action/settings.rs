//! Execution settings attached to action definitions.

use crate::broker::JobBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default execution timeout for a queued action (5 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default worker concurrency for the general pool.
pub const DEFAULT_CONCURRENCY: usize = 500;

/// Worker concurrency for ad-hoc scheduled and cron workers.
pub const SCHEDULED_WORKER_CONCURRENCY: usize = 10;

/// Grace period for queue shutdown before giving up on in-flight work.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for queued execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (1 = no retries).
    pub attempts: u32,
    /// Backoff between attempts.
    pub backoff: Option<JobBackoff>,
}

/// Named recurrence schedule for cron actions.
///
/// Cron patterns come exclusively from this fixed table — actions reference
/// an interval by name and the runtime resolves the pattern when arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum CronInterval {
    EveryMinute,
    EveryFiveMinutes,
    EveryTenMinutes,
    EveryFifteenMinutes,
    EveryThirtyMinutes,
    EveryHour,
    EveryTwoHours,
    EveryThreeHours,
    EverySixHours,
    EveryTwelveHours,
    EveryDay,
    EveryDayAtMidnight,
    EveryDayAtNoon,
    EveryDayAt6am,
    EveryDayAt7am,
    EveryDayAt8am,
    EveryMonday,
    EveryTuesday,
    EveryWednesday,
    EveryThursday,
    EveryFriday,
    EverySaturday,
    EverySunday,
    EveryWeek,
    EveryMonth,
    EveryQuarter,
    EverySixMonths,
    EveryYear,
    EveryWeekday,
    EveryWeekend,
}

impl CronInterval {
    /// The five-field cron pattern for this interval.
    #[must_use]
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::EveryMinute => "* * * * *",
            Self::EveryFiveMinutes => "*/5 * * * *",
            Self::EveryTenMinutes => "*/10 * * * *",
            Self::EveryFifteenMinutes => "*/15 * * * *",
            Self::EveryThirtyMinutes => "*/30 * * * *",
            Self::EveryHour => "0 * * * *",
            Self::EveryTwoHours => "0 */2 * * *",
            Self::EveryThreeHours => "0 */3 * * *",
            Self::EverySixHours => "0 */6 * * *",
            Self::EveryTwelveHours => "0 */12 * * *",
            Self::EveryDay | Self::EveryDayAtMidnight => "0 0 * * *",
            Self::EveryDayAtNoon => "0 12 * * *",
            Self::EveryDayAt6am => "0 6 * * *",
            Self::EveryDayAt7am => "0 7 * * *",
            Self::EveryDayAt8am => "0 8 * * *",
            Self::EveryMonday => "0 0 * * 1",
            Self::EveryTuesday => "0 0 * * 2",
            Self::EveryWednesday => "0 0 * * 3",
            Self::EveryThursday => "0 0 * * 4",
            Self::EveryFriday => "0 0 * * 5",
            Self::EverySaturday => "0 0 * * 6",
            Self::EverySunday | Self::EveryWeek => "0 0 * * 0",
            Self::EveryMonth => "0 0 1 * *",
            Self::EveryQuarter => "0 0 1 */3 *",
            Self::EverySixMonths => "0 0 1 */6 *",
            Self::EveryYear => "0 0 1 1 *",
            Self::EveryWeekday => "0 0 * * 1-5",
            Self::EveryWeekend => "0 0 * * 6,0",
        }
    }
}

/// Settings controlling how an action validates and executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionSettings {
    /// Check the input contract at the call boundary.
    pub validate_input: bool,
    /// Check the output contract at the call boundary.
    pub validate_output: bool,
    /// Worker-side execution timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Worker concurrency for this action's queue.
    pub concurrency: usize,
    /// Recurrence schedule; makes the action cron-eligible.
    pub cron: Option<CronInterval>,
    /// Retry policy for queued execution.
    pub retry: Option<RetryPolicy>,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            validate_input: true,
            validate_output: true,
            timeout: DEFAULT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            cron: None,
            retry: None,
        }
    }
}

impl ActionSettings {
    /// Settings with a cron interval set.
    #[must_use]
    pub fn cron(interval: CronInterval) -> Self {
        Self {
            cron: Some(interval),
            ..Self::default()
        }
    }

    /// Override the worker concurrency.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Override the execution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Serde helper for serializing Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::next_cron_run;
    use chrono::Utc;

    #[test]
    fn test_defaults() {
        let settings = ActionSettings::default();
        assert!(settings.validate_input);
        assert!(settings.validate_output);
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
        assert_eq!(settings.concurrency, DEFAULT_CONCURRENCY);
        assert!(settings.cron.is_none());
        assert!(settings.retry.is_none());
    }

    #[test]
    fn test_every_cron_pattern_parses() {
        let intervals = [
            CronInterval::EveryMinute,
            CronInterval::EveryFiveMinutes,
            CronInterval::EveryTenMinutes,
            CronInterval::EveryFifteenMinutes,
            CronInterval::EveryThirtyMinutes,
            CronInterval::EveryHour,
            CronInterval::EveryTwoHours,
            CronInterval::EveryThreeHours,
            CronInterval::EverySixHours,
            CronInterval::EveryTwelveHours,
            CronInterval::EveryDay,
            CronInterval::EveryDayAtMidnight,
            CronInterval::EveryDayAtNoon,
            CronInterval::EveryDayAt6am,
            CronInterval::EveryDayAt7am,
            CronInterval::EveryDayAt8am,
            CronInterval::EveryMonday,
            CronInterval::EveryTuesday,
            CronInterval::EveryWednesday,
            CronInterval::EveryThursday,
            CronInterval::EveryFriday,
            CronInterval::EverySaturday,
            CronInterval::EverySunday,
            CronInterval::EveryWeek,
            CronInterval::EveryMonth,
            CronInterval::EveryQuarter,
            CronInterval::EverySixMonths,
            CronInterval::EveryYear,
            CronInterval::EveryWeekday,
            CronInterval::EveryWeekend,
        ];
        let now = Utc::now();
        for interval in intervals {
            assert!(
                next_cron_run(interval.pattern(), now).is_ok(),
                "pattern failed for {interval:?}"
            );
        }
    }

    #[test]
    fn test_day_aliases_share_pattern() {
        assert_eq!(
            CronInterval::EveryDay.pattern(),
            CronInterval::EveryDayAtMidnight.pattern()
        );
        assert_eq!(
            CronInterval::EverySunday.pattern(),
            CronInterval::EveryWeek.pattern()
        );
    }
}
