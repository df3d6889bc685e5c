//! Retry policy and the bounded retry loop used for store calls.
//!
//! Two things retry in this crate:
//!
//! 1. **Handler attempts.** [`crate::executor::ActionRunner`] drives its own
//!    attempt counter so that the count is persisted on every attempt and an
//!    interrupted invocation resumes where it stopped. It only borrows
//!    [`RetryPolicy::delay_for_attempt`] from here.
//! 2. **Store calls.** A conditional write that fails for a transient reason
//!    (busy database, dropped connection) is retried in-process with
//!    [`retry_with_policy`]. Whether an error is transient is decided by
//!    [`crate::executor::Retryable`].

use std::future::Future;
use std::time::Duration;

/// Attempt budget and exponential backoff schedule.
///
/// The delay after failed attempt `n` (1-indexed) is
/// `min(initial_delay * backoff_multiplier^(n-1), max_delay)`.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// 3 attempts: immediate, then 1s, then 2s.
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// 10 attempts starting at 100ms with a 1.5x multiplier, capped at 10s.
    pub const AGGRESSIVE: Self = Self {
        max_attempts: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 1.5,
    };

    /// Short policy for store contention: 5 attempts, 10ms doubling to 200ms.
    pub const STORE_CONTENTION: Self = Self {
        max_attempts: 5,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(200),
        backoff_multiplier: 2.0,
    };

    /// Standard delays with a custom attempt budget.
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Replaces the backoff schedule, keeping the attempt budget.
    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    /// The attempt budget, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed), or `None`
    /// once the budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.attempts() {
            return None;
        }

        let exponent = (attempt - 1) as f64;
        let multiplier = self.backoff_multiplier.powf(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        // powf can overflow to inf for large exponents; the cap absorbs it
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(capped.max(0.0)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl From<u32> for RetryPolicy {
    fn from(max_attempts: u32) -> Self {
        Self::with_max_attempts(max_attempts)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt budget is spent.
///
/// The closure receives the 1-indexed attempt number.
pub async fn retry_with_policy<F, Fut, T, E>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: crate::executor::Retryable + std::fmt::Debug,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() {
                    tracing::debug!(attempt, ?error, "operation failed with non-retryable error");
                    return Err(error);
                }

                match policy.delay_for_attempt(attempt) {
                    Some(delay) => {
                        tracing::debug!(
                            attempt,
                            max_attempts = policy.attempts(),
                            ?delay,
                            ?error,
                            "operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::warn!(
                            attempt,
                            max_attempts = policy.attempts(),
                            ?error,
                            "operation failed and exhausted retry attempts"
                        );
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Like [`duration_millis`] for `Option<Duration>`.
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
