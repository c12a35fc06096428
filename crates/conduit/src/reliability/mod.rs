//! Failure handling
//!
//! This module provides:
//! - [`RetryPolicy`] - Delay between task attempts (fixed, linear or exponential)
//! - [`CircuitBreaker`] - Fail fast while a downstream is unhealthy

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitPermit, CircuitState,
};
pub use retry::{Backoff, RetryPolicy};
