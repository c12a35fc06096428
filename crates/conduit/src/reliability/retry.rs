//! Retry delay policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;
use crate::error::{Result, RuntimeError};

/// How the delay grows between consecutive retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// `initial_interval * retry`
    Linear,
    /// `initial_interval * coefficient^(retry - 1)`
    Exponential,
}

/// Delay policy applied between task attempts
///
/// The number of attempts is owned by the task (`max_retries`); the policy
/// only decides how long to wait and which error types are terminal.
///
/// # Example
///
/// ```
/// use conduit::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(Duration::from_millis(100))
///     .with_max_interval(Duration::from_secs(5))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay growth strategy
    pub backoff: Backoff,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Multiplier for exponential backoff
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// Same delay before every retry
    pub fn fixed(interval: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Delay grows by `step` with every retry
    pub fn linear(step: Duration) -> Self {
        Self {
            backoff: Backoff::Linear,
            initial_interval: step,
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Doubling delay with 10% jitter, capped at 60 seconds
    pub fn exponential(initial: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential,
            initial_interval: initial,
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Retry immediately
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "backoff_coefficient must be finite and at least 1.0, got {}",
                self.backoff_coefficient
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RuntimeError::InvalidConfig(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay to wait before `attempt` (1-based)
    ///
    /// The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry = attempt - 1;
        let initial = self.initial_interval.as_secs_f64();
        let base = match self.backoff {
            Backoff::Fixed => initial,
            Backoff::Linear => initial * f64::from(retry),
            Backoff::Exponential => {
                initial * self.backoff_coefficient.powi(retry.saturating_sub(1) as i32)
            }
        };
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        // Saturate values a Duration cannot hold
        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_never_waits() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(50));
    }

    #[test]
    fn test_linear_interval() {
        let policy = RetryPolicy::linear(Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(40));
    }

    #[test]
    fn test_exponential_interval() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));

        let linear =
            RetryPolicy::linear(Duration::from_secs(1)).with_max_interval(Duration::from_secs(3));
        assert_eq!(linear.delay_for_attempt(10), Duration::from_secs(3));
    }

    #[test]
    fn test_unbounded_cap_saturates() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1))
            .with_max_interval(Duration::MAX)
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(200), Duration::MAX);

        let jittered = RetryPolicy::exponential(Duration::from_secs(1))
            .with_max_interval(Duration::MAX)
            .with_jitter(0.5);
        assert!(jittered.delay_for_attempt(200) > Duration::from_secs(3600));
    }

    #[test]
    fn test_bad_coefficient_is_rejected_and_never_panics() {
        for coefficient in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let policy = RetryPolicy::exponential(Duration::from_secs(1))
                .with_backoff_coefficient(coefficient)
                .with_jitter(0.0);
            assert!(policy.validate().is_err());
            assert!(policy.delay_for_attempt(4) <= policy.max_interval);
        }
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::exponential(Duration::from_secs(1))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100)).with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::default()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_serialization() {
        let policy =
            RetryPolicy::linear(Duration::from_millis(25)).with_non_retryable_error("TEST");

        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"backoff\":\"linear\""));
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
