//! Exponential backoff with a ceiling and a total budget.

use std::time::{Duration, Instant};

/// Retry timing parameters for find/ask/tell drivers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Ceiling for the doubled delay.
    pub max_interval: Duration,
    /// Total budget; once elapsed, the operation fails with a timeout.
    pub duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(1000),
            duration: Duration::from_millis(10_000),
        }
    }
}

/// Delay sequence for one retried operation.
///
/// The delay doubles on each attempt (`initial * 2^attempt`), saturating at
/// `max_interval`. [`Backoff::next_delay`] returns `None` once the total
/// `duration` budget is spent.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    started: Instant,
}

impl Backoff {
    /// Starts a new delay sequence.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Returns the next delay, or `None` when the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.policy.duration {
            return None;
        }
        let delay = delay_for_attempt(
            self.attempt,
            self.policy.initial_interval,
            self.policy.max_interval,
        );
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn delay_for_attempt(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    let multiplier = u32::try_from(multiplier).unwrap_or(u32::MAX);
    initial.saturating_mul(multiplier).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_to_ceiling() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(500);

        assert_eq!(delay_for_attempt(0, initial, max), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(1, initial, max), Duration::from_millis(200));
        assert_eq!(delay_for_attempt(2, initial, max), Duration::from_millis(400));
        assert_eq!(delay_for_attempt(3, initial, max), Duration::from_millis(500));
        assert_eq!(delay_for_attempt(30, initial, max), Duration::from_millis(500));
    }

    #[test]
    fn budget_exhaustion_returns_none() {
        let mut backoff = Backoff::new(RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            duration: Duration::ZERO,
        });
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn sequence_advances_attempts() {
        let mut backoff = Backoff::new(RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(8),
            duration: Duration::from_secs(60),
        });

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(4)));
        assert_eq!(backoff.attempts(), 3);
    }
}
