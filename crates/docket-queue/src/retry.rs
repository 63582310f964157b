//! Retry decisions with exponential backoff.

use std::time::Duration;

use crate::job::JobOptions;

/// Upper bound applied to every computed backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// What to do after a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue; the job must not be claimed again before `delay` elapses.
    Retry { delay: Duration },
    /// Attempts exhausted; the job fails permanently.
    GiveUp,
}

/// Exponential backoff: `base * 2^(attempt - 1)`, clamped to [`MAX_BACKOFF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn from_options(options: &JobOptions) -> Self {
        Self::new(options.max_attempts, options.backoff_base())
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Decide after attempt number `attempt` (counted from 1) has failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.delay_after(attempt),
            }
        }
    }

    /// Delay inserted after failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Free-function form of [`RetryPolicy::decide`].
pub fn decide(attempt: u32, max_attempts: u32, backoff_base: Duration) -> RetryDecision {
    RetryPolicy::new(max_attempts, backoff_base).decide(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new(5, Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(16_000));
    }

    #[test]
    fn test_retry_until_max_attempts() {
        let base = Duration::from_millis(1_000);
        assert_eq!(
            decide(1, 3, base),
            RetryDecision::Retry {
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(
            decide(2, 3, base),
            RetryDecision::Retry {
                delay: Duration::from_millis(2_000)
            }
        );
        assert_eq!(decide(3, 3, base), RetryDecision::GiveUp);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert_eq!(decide(1, 1, Duration::from_secs(1)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_attempt_past_max_gives_up() {
        assert_eq!(decide(7, 3, Duration::from_secs(1)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_delay_is_clamped() {
        let policy = RetryPolicy::new(100, Duration::from_secs(2));
        assert_eq!(policy.delay_after(40), MAX_BACKOFF);
        assert_eq!(policy.delay_after(u32::MAX), MAX_BACKOFF);

        let tight = policy.with_max_backoff(Duration::from_secs(5));
        assert_eq!(tight.delay_after(3), Duration::from_secs(5));
    }

    #[test]
    fn test_from_options() {
        let options = JobOptions::default()
            .with_max_attempts(5)
            .with_backoff_base(Duration::from_millis(1_000));
        let policy = RetryPolicy::from_options(&options);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base, Duration::from_millis(1_000));
    }
}
