//! Reconnect backoff for the relay connection

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Reconnect policy for the relay connection
///
/// Controls how many consecutive failed attempts are tolerated and how long
/// to wait between attempts using exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum consecutive failed attempts; 0 retries forever
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds (doubles each attempt)
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Base delay
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    #[must_use]
    pub const fn should_retry(&self, failures: u32) -> bool {
        self.max_retries == 0 || failures < self.max_retries
    }
}

/// Compute the delay before the next attempt.
///
/// Exponential backoff: `min(base_delay * 2^attempt + jitter, max_delay)`.
/// Jitter is 0-25% of the computed delay, derived from `SystemTime`.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay()
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let base = base.min(policy.max_delay());

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    // Scale to 0-25% of the base delay
    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay())
}
