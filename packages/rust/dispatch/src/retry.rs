//! Retry policy: pure decisions from (error, attempt) to retry-or-stop plus delay.

use std::time::Duration;

use feedforge_shared::RetryConfig;

use crate::error::Classify;

/// Result of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Exponential backoff with a hard attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 4,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// `base_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Decide what to do after the attempt with zero-based index `attempt` failed.
    pub fn should_retry<E: Classify + ?Sized>(&self, error: &E, attempt: u32) -> RetryDecision {
        if attempt.saturating_add(1) >= self.max_attempts {
            return RetryDecision::give_up();
        }
        if !error.class().is_retryable() {
            return RetryDecision::give_up();
        }

        let computed = self.backoff(attempt);
        let delay = match error.retry_after() {
            Some(hint) => hint.max(computed).min(self.max_delay),
            None => computed,
        };
        RetryDecision::after(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CompletionError, ErrorClass};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        }
    }

    #[test]
    fn decision_table() {
        let secs = Duration::from_secs;
        let cases = [
            (ErrorClass::TransientNetwork, 0, RetryDecision::after(secs(1))),
            (ErrorClass::RateLimited, 1, RetryDecision::after(secs(2))),
            (ErrorClass::Upstream5xx, 3, RetryDecision::after(secs(8))),
            (ErrorClass::Timeout, 5, RetryDecision::after(secs(32))),
            (ErrorClass::Upstream5xx, 6, RetryDecision::after(secs(60))),
            (ErrorClass::Authentication, 0, RetryDecision::give_up()),
            (ErrorClass::Validation, 0, RetryDecision::give_up()),
            (ErrorClass::QuotaExhausted, 2, RetryDecision::give_up()),
            // Ceiling: attempt index 7 is the eighth and last attempt.
            (ErrorClass::TransientNetwork, 7, RetryDecision::give_up()),
            (ErrorClass::RateLimited, 100, RetryDecision::give_up()),
        ];

        let policy = policy();
        for (class, attempt, expected) in cases {
            let err = CompletionError::new(class, "test");
            assert_eq!(
                policy.should_retry(&err, attempt),
                expected,
                "{class} at attempt {attempt}"
            );
        }
    }

    #[test]
    fn retry_after_hint_wins_when_longer() {
        let policy = policy();
        let hinted = CompletionError::rate_limited("429", Some(Duration::from_secs(10)));
        assert_eq!(policy.should_retry(&hinted, 0).delay, Duration::from_secs(10));

        let short = CompletionError::rate_limited("429", Some(Duration::from_millis(10)));
        assert_eq!(policy.should_retry(&short, 2).delay, Duration::from_secs(4));

        let huge = CompletionError::rate_limited("429", Some(Duration::from_secs(3600)));
        assert_eq!(policy.should_retry(&huge, 0).delay, Duration::from_secs(60));
    }

    #[test]
    fn backoff_survives_huge_attempts() {
        let policy = policy();
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn single_attempt_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        let err = CompletionError::new(ErrorClass::Timeout, "slow");
        assert!(!policy.should_retry(&err, 0).retry);
    }
}
