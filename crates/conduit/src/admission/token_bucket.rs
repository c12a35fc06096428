//! Token bucket limiter
//!
//! Refill is lazy: nothing runs in the background, the bucket catches up on
//! each access. Token counts are kept in nano-tokens with an exact carry of
//! the division remainder, so repeated refills over long uptimes never drift.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Admission;
use crate::config::duration_millis;
use crate::error::{Result, RuntimeError};

const NANOS_PER_TOKEN: u128 = 1_000_000_000;

/// Token bucket configuration
///
/// `refill_tokens` are added every `refill_period`, pro rata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenBucketConfig {
    /// Maximum tokens held
    pub capacity: u64,

    /// Tokens added per refill period
    pub refill_tokens: u64,

    /// Refill period
    #[serde(with = "duration_millis")]
    pub refill_period: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self::per_second(100, 50)
    }
}

impl TokenBucketConfig {
    /// Bucket holding `capacity` tokens, refilled at `rate` tokens per second
    pub fn per_second(capacity: u64, rate: u64) -> Self {
        Self {
            capacity,
            refill_tokens: rate,
            refill_period: Duration::from_secs(1),
        }
    }

    /// Set the capacity
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the refill rate as `tokens` per `period`
    pub fn with_refill(mut self, tokens: u64, period: Duration) -> Self {
        self.refill_tokens = tokens;
        self.refill_period = period;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "token bucket capacity must be positive".into(),
            ));
        }
        if self.refill_tokens == 0 || self.refill_period.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "token bucket refill rate must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    nanotokens: u128,
    carry: u128,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// Starts full. A request costing more than `capacity` is never admitted.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    capacity_nanos: u128,
    period_nanos: u128,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: TokenBucketConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    pub(crate) fn starting_at(config: TokenBucketConfig, now: Instant) -> Self {
        let capacity_nanos = u128::from(config.capacity) * NANOS_PER_TOKEN;
        let period_nanos = config.refill_period.as_nanos().max(1);
        Self {
            config,
            capacity_nanos,
            period_nanos,
            state: Mutex::new(BucketState {
                nanotokens: capacity_nanos,
                carry: 0,
                last_refill: now,
            }),
        }
    }

    /// Configuration this bucket was built from
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        self.available_at(Instant::now())
    }

    pub(crate) fn available_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        u64::try_from(state.nanotokens / NANOS_PER_TOKEN).unwrap_or(u64::MAX)
    }

    pub(crate) fn allow_at(&self, cost: u64, now: Instant) -> bool {
        let cost_nanos = u128::from(cost) * NANOS_PER_TOKEN;
        if cost_nanos > self.capacity_nanos {
            return false;
        }

        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.nanotokens >= cost_nanos {
            state.nanotokens -= cost_nanos;
            true
        } else {
            false
        }
    }

    /// How long until `cost` tokens will be available, assuming no other consumers
    pub fn time_until(&self, cost: u64) -> Option<Duration> {
        let cost_nanos = u128::from(cost) * NANOS_PER_TOKEN;
        if cost_nanos > self.capacity_nanos {
            return None;
        }

        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        let missing = cost_nanos.saturating_sub(state.nanotokens);
        if missing == 0 {
            return Some(Duration::ZERO);
        }

        // missing nano-tokens => missing * period / (refill_tokens * 1e9) nanoseconds
        let per_period = u128::from(self.config.refill_tokens) * NANOS_PER_TOKEN;
        let nanos = (missing * self.period_nanos).div_ceil(per_period);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        if elapsed == 0 {
            return;
        }
        state.last_refill = now;

        if state.nanotokens >= self.capacity_nanos {
            state.carry = 0;
            return;
        }

        let numerator = elapsed
            .checked_mul(u128::from(self.config.refill_tokens))
            .and_then(|n| n.checked_mul(NANOS_PER_TOKEN))
            .and_then(|n| n.checked_add(state.carry));
        let Some(numerator) = numerator else {
            // Overflow means far more than a full bucket's worth
            state.nanotokens = self.capacity_nanos;
            state.carry = 0;
            return;
        };
        let added = numerator / self.period_nanos;
        state.carry = numerator % self.period_nanos;

        state.nanotokens = state.nanotokens.saturating_add(added);
        if state.nanotokens >= self.capacity_nanos {
            state.nanotokens = self.capacity_nanos;
            state.carry = 0;
        }
    }
}

#[async_trait]
impl Admission for TokenBucket {
    fn allow(&self, cost: u64) -> bool {
        self.allow_at(cost, Instant::now())
    }

    fn admissible(&self, cost: u64) -> bool {
        cost <= self.config.capacity
    }

    fn poll_interval(&self) -> Duration {
        // Sleep roughly until one token arrives, bounded to stay responsive
        let per_period = u32::try_from(self.config.refill_tokens).unwrap_or(u32::MAX).max(1);
        let one_token = self.config.refill_period / per_period;
        one_token.clamp(Duration::from_millis(1), Duration::from_millis(50))
    }
}
