use crate::core::retry::{duration_millis, option_duration_millis};
use crate::core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of actions running at once within one invocation.
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default bound on a single handler call.
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wait between store reads while actions run under another invocation.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Engine tuning.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use actiongraph::EngineConfig;
/// use std::time::Duration;
///
/// let config: EngineConfig =
///     serde_json::from_str(r#"{"max_concurrency": 8, "time_budget": 840000}"#).unwrap();
/// assert_eq!(config.max_concurrency, 8);
/// assert_eq!(config.time_budget, Some(Duration::from_secs(840)));
/// assert_eq!(config.stale_threshold(), Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running actions.
    pub max_concurrency: usize,

    /// Attempt budget and backoff for transient handler failures.
    pub retry: RetryPolicy,

    /// Bound on each `execute` call. A timeout counts as a transient failure.
    #[serde(with = "duration_millis")]
    pub action_timeout: Duration,

    /// Bound on each `rollback` call. A timeout counts as a rollback failure.
    #[serde(with = "duration_millis")]
    pub rollback_timeout: Duration,

    /// Age after which a `running` action with no progress is considered
    /// abandoned. Defaults to the larger of twice `action_timeout` and
    /// `action_timeout + retry.max_delay`.
    ///
    /// A runner sleeping out its backoff does not touch the record, so an
    /// explicit value below `action_timeout + retry.max_delay` can reclaim
    /// live runners.
    #[serde(with = "option_duration_millis")]
    pub stale_after: Option<Duration>,

    /// Wall-clock budget for one invocation. When it runs out the engine
    /// stops dispatching and returns with the run still in progress.
    #[serde(with = "option_duration_millis")]
    pub time_budget: Option<Duration>,

    /// Wait between state reads while actions are running elsewhere.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Retry policy for transient store errors.
    pub store_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::STANDARD,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            rollback_timeout: DEFAULT_ACTION_TIMEOUT,
            stale_after: None,
            time_budget: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            store_retry: RetryPolicy::STORE_CONTENTION,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = Some(threshold);
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    /// Concurrency bound, never less than one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    /// Age after which a running action is reclaimed.
    pub fn stale_threshold(&self) -> Duration {
        self.stale_after.unwrap_or_else(|| {
            let twice = self.action_timeout.saturating_mul(2);
            let backoff = self.action_timeout.saturating_add(self.retry.max_delay);
            twice.max(backoff)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency(), 4);
        assert_eq!(config.retry, RetryPolicy::STANDARD);
        assert_eq!(config.stale_threshold(), Duration::from_secs(600));
        assert!(config.time_budget.is_none());
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(EngineConfig::new().with_max_concurrency(0).concurrency(), 1);
    }

    #[test]
    fn test_explicit_stale_threshold_wins() {
        let config = EngineConfig::new()
            .with_action_timeout(Duration::from_secs(10))
            .with_stale_after(Duration::from_secs(5));
        assert_eq!(config.stale_threshold(), Duration::from_secs(5));
    }

    #[test]
    fn test_stale_threshold_outlasts_backoff() {
        let config = EngineConfig::new()
            .with_action_timeout(Duration::from_secs(5))
            .with_retry(
                RetryPolicy::with_max_attempts(3)
                    .with_backoff(Duration::from_secs(1), Duration::from_secs(60)),
            );
        assert_eq!(config.stale_threshold(), Duration::from_secs(65));
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = EngineConfig::new()
            .with_retry(5)
            .with_time_budget(Duration::from_secs(60));
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, config);
    }
}
