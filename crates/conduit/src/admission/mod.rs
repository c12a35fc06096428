//! Admission control
//!
//! This module provides:
//! - [`Admission`] - the contract shared by all limiters
//! - [`TokenBucket`] - lazily refilled bucket with fixed-point arithmetic
//! - [`SlidingWindow`] - event counter over a trailing window
//! - [`AdmissionConfig`] - configuration that picks one strategy
//!
//! Limiters only answer "may this proceed now?". They never queue or retry
//! on the caller's behalf; a denied caller gets `false` or
//! [`RuntimeError::RateLimited`] right away.

mod sliding_window;
mod token_bucket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Result, RuntimeError};
use crate::lifecycle::CancelSignal;

pub use sliding_window::{SlidingWindow, SlidingWindowConfig};
pub use token_bucket::{TokenBucket, TokenBucketConfig};

/// Default sleep between attempts in [`Admission::allow_blocking`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Admission contract
///
/// Implementations must be safe under concurrent callers.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Admit `cost` units now, or return `false` without side effects
    fn allow(&self, cost: u64) -> bool;

    /// Whether `cost` could ever be admitted by this limiter
    fn admissible(&self, cost: u64) -> bool;

    /// Sleep between polls in [`allow_blocking`](Self::allow_blocking)
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Poll [`allow`](Self::allow) until it succeeds or `timeout` passes
    async fn allow_blocking(&self, cost: u64, timeout: Duration) -> bool {
        if !self.admissible(cost) {
            return false;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.allow(cost) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval().min(deadline - now)).await;
        }
    }

    /// Blocking admission that also gives up on cancellation
    ///
    /// # Errors
    ///
    /// [`RuntimeError::RateLimited`] on timeout, [`RuntimeError::Cancelled`]
    /// if `signal` fires first.
    async fn acquire(&self, cost: u64, timeout: Duration, signal: &CancelSignal) -> Result<()> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(RuntimeError::Cancelled),
            admitted = self.allow_blocking(cost, timeout) => {
                if admitted {
                    Ok(())
                } else {
                    Err(RuntimeError::RateLimited)
                }
            }
        }
    }
}

/// Limiter selection
///
/// # Example
///
/// ```
/// use conduit::admission::{AdmissionConfig, TokenBucketConfig};
///
/// let limiter = AdmissionConfig::TokenBucket(TokenBucketConfig::per_second(100, 20)).build();
/// assert!(limiter.allow(1));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AdmissionConfig {
    /// Token bucket
    TokenBucket(TokenBucketConfig),
    /// Sliding window counter
    SlidingWindow(SlidingWindowConfig),
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::TokenBucket(TokenBucketConfig::default())
    }
}

impl AdmissionConfig {
    /// Validate the selected strategy's settings
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::TokenBucket(config) => config.validate(),
            Self::SlidingWindow(config) => config.validate(),
        }
    }

    /// Build the configured limiter
    pub fn build(&self) -> Arc<dyn Admission> {
        match self {
            Self::TokenBucket(config) => Arc::new(TokenBucket::new(config.clone())),
            Self::SlidingWindow(config) => Arc::new(SlidingWindow::new(config.clone())),
        }
    }

    /// Strategy name used in logs and env configuration
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::TokenBucket(_) => "token_bucket",
            Self::SlidingWindow(_) => "sliding_window",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleController;

    #[test]
    fn test_default_is_token_bucket() {
        let config = AdmissionConfig::default();
        assert_eq!(config.strategy(), "token_bucket");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_build_both_strategies() {
        let bucket = AdmissionConfig::TokenBucket(TokenBucketConfig::per_second(2, 1)).build();
        assert!(bucket.allow(2));
        assert!(!bucket.allow(1));

        let window = AdmissionConfig::SlidingWindow(SlidingWindowConfig::new(
            2,
            Duration::from_secs(60),
        ))
        .build();
        assert!(window.allow(1));
        assert!(window.allow(1));
        assert!(!window.allow(1));
    }

    #[test]
    fn test_serialization() {
        let config = AdmissionConfig::SlidingWindow(SlidingWindowConfig::new(
            10,
            Duration::from_millis(1500),
        ));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"strategy\":\"sliding_window\""));

        let parsed: AdmissionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_blocking_waits_for_refill() {
        let limiter = TokenBucket::new(TokenBucketConfig::per_second(1, 10));
        assert!(limiter.allow(1));

        // 10 tokens/s => one token after 100ms
        assert!(limiter.allow_blocking(1, Duration::from_millis(500)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_blocking_times_out() {
        let limiter = SlidingWindow::new(SlidingWindowConfig::new(1, Duration::from_secs(10)));
        assert!(limiter.allow(1));

        let started = Instant::now();
        assert!(!limiter.allow_blocking(1, Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_allow_blocking_rejects_oversized_cost_immediately() {
        let limiter = TokenBucket::new(TokenBucketConfig::per_second(5, 5));
        let started = std::time::Instant::now();
        assert!(!limiter.allow_blocking(6, Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_maps_denial_to_rate_limited() {
        let limiter = SlidingWindow::new(SlidingWindowConfig::new(1, Duration::from_secs(10)));
        let controller = LifecycleController::new();
        let signal = controller.signal();

        assert!(limiter.acquire(1, Duration::ZERO, &signal).await.is_ok());
        let err = limiter
            .acquire(1, Duration::from_millis(50), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RateLimited));
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let limiter = SlidingWindow::new(SlidingWindowConfig::new(1, Duration::from_secs(60)));
        assert!(limiter.allow(1));

        let controller = LifecycleController::new();
        controller.cancel();

        let err = limiter
            .acquire(1, Duration::from_secs(30), &controller.signal())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
