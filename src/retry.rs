//! Bounded retry with fatal escalation.
//!
//! [`BoundedRetry`] counts consecutive failures against a [`RetryPolicy`].
//! Once the count reaches the cap every further failure is [`RetryDecision::Exhausted`]
//! and the counter stays there until [`BoundedRetry::reset`] or a success.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
    /// Factor applied to the delay after every further failure. `1` keeps it flat.
    pub multiplier: u32,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            multiplier: 1,
        }
    }

    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay to wait after the `failures`-th consecutive failure.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct BoundedRetry {
    policy: RetryPolicy,
    failures: u32,
}

impl BoundedRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.policy.max_attempts
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1).min(self.policy.max_attempts);

        if self.is_exhausted() {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.policy.delay_after(self.failures))
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalates_after_cap() {
        let mut retry = BoundedRetry::new(RetryPolicy::new(3, Duration::from_secs(2)));

        assert_eq!(
            retry.record_failure(),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            retry.record_failure(),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(retry.record_failure(), RetryDecision::Exhausted);
        assert!(retry.is_exhausted());

        // Stays exhausted.
        assert_eq!(retry.record_failure(), RetryDecision::Exhausted);
        assert_eq!(retry.failures(), 3);

        retry.reset();
        assert!(!retry.is_exhausted());
    }

    #[test]
    fn test_success_resets_counter() {
        let mut retry = BoundedRetry::new(RetryPolicy::default());
        retry.record_failure();
        retry.record_failure();
        retry.record_success();
        assert_eq!(retry.failures(), 0);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_multiplier(2);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }
}
