//! Backoff policy for upload retries.

use std::time::Duration;

/// Exponential backoff with equal jitter: base * 2^attempt, capped, with
/// the upper half randomized so workers do not thunder in step while the
/// delay still grows with every attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before attempt number `attempt` (0-based). A server-provided
    /// Retry-After wins over the computed backoff.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            return after;
        }
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }
}

pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempt.min(20)))
        .min(max);
    let millis = exp.as_millis().max(2) as u64;
    Duration::from_millis(millis / 2 + rand::random_range(0..=millis / 2))
}

/// Parse a Retry-After header value in delay-seconds form.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
