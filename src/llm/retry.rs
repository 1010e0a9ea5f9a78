//! Bounded retry with exponential backoff and jitter.
//!
//! Only transport-level and designated-transient failures (rate limits, 5xx)
//! are retried; fatal HTTP and parse errors surface immediately. Exhausting
//! the attempt budget is reported as its own error so callers can tell a
//! worn-out retry streak from a first-attempt failure.

use rand::Rng;
use std::time::Duration;

/// Retry policy for provider invocations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryConfig {
    /// No retries at all (tests, fail-fast callers).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Tight delays for tests.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
        }
    }

    /// Backoff delay before retry number `attempt` (1-based), with jitter.
    ///
    /// The nominal curve doubles each attempt and is capped at `max_delay`;
    /// jitter scales the nominal value into `[0.5x, 1.0x]` so concurrent
    /// agents do not retry in lockstep. Nominal values are non-decreasing
    /// across a failure streak.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        nominal.mul_f64(factor)
    }

    /// The un-jittered delay for retry number `attempt` (1-based).
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base_delay.saturating_mul(1_u32 << exponent);
        scaled.min(self.max_delay)
    }
}

/// All retry attempts were exhausted.
#[derive(Clone, Debug)]
pub struct RetryError {
    pub attempts: u32,
    pub last_message: String,
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed after {} attempts, last error: {}",
            self.attempts, self.last_message
        )
    }
}

impl std::error::Error for RetryError {}
