//! Runtime configuration
//!
//! Every component has its own config struct; [`RuntimeConfig`] bundles them
//! for processes that wire the whole runtime from the environment.
//!
//! Environment variables (all optional, invalid values fall back to defaults):
//! - `CONDUIT_WORKERS`: pool worker count
//! - `CONDUIT_QUEUE_CAPACITY`: pool queue capacity
//! - `CONDUIT_MAX_RETRIES`: retries after the first attempt
//! - `CONDUIT_ATTEMPT_TIMEOUT_MS`: per-attempt timeout
//! - `CONDUIT_RETRY_DELAY_MS`: fixed delay between retries
//! - `CONDUIT_SHUTDOWN_TIMEOUT_MS`: graceful drain bound
//! - `CONDUIT_ADMISSION`: `token_bucket` (default) or `sliding_window`
//! - `CONDUIT_BUCKET_CAPACITY`, `CONDUIT_BUCKET_REFILL_PER_SEC`
//! - `CONDUIT_WINDOW_MAX`, `CONDUIT_WINDOW_MS`
//! - `CONDUIT_CIRCUIT_THRESHOLD`, `CONDUIT_CIRCUIT_RESET_MS`
//! - `CONDUIT_STAGE_BUFFER`: per-stage buffer capacity
//! - `CONDUIT_FAN_IN_BATCH`: fan-in batch size

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionConfig, SlidingWindowConfig, TokenBucketConfig};
use crate::error::{Result, RuntimeError};
use crate::fanout::{FanInConfig, FanOutConfig};
use crate::pipeline::PipelineConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::worker::WorkerPoolConfig;

/// Default capacity of each pipeline stage buffer
pub const DEFAULT_STAGE_BUFFER: usize = 64;

/// Configuration for a whole runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool settings
    pub pool: WorkerPoolConfig,

    /// Admission control in front of the pool
    pub admission: AdmissionConfig,

    /// Circuit breaker around handler attempts
    pub circuit_breaker: CircuitBreakerConfig,

    /// Pipeline channel settings
    pub pipeline: PipelineConfig,

    /// Buffer capacity for each pipeline stage
    pub stage_buffer: usize,

    /// Fan-out settings
    pub fan_out: FanOutConfig,

    /// Fan-in settings
    pub fan_in: FanInConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            admission: AdmissionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pipeline: PipelineConfig::default(),
            stage_buffer: DEFAULT_STAGE_BUFFER,
            fan_out: FanOutConfig::default(),
            fan_in: FanInConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `CONDUIT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Unset or unparsable keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| parse_value::<u64>(&v));
        let millis = |key: &str| parse(key).map(Duration::from_millis);

        let mut config = Self::default();

        let pool = &mut config.pool;
        if let Some(workers) = parse("CONDUIT_WORKERS") {
            pool.workers = workers as usize;
        }
        if let Some(capacity) = parse("CONDUIT_QUEUE_CAPACITY") {
            pool.queue_capacity = capacity as usize;
        }
        if let Some(retries) = lookup("CONDUIT_MAX_RETRIES").and_then(|v| parse_value(&v)) {
            pool.max_retries = retries;
        }
        if let Some(timeout) = millis("CONDUIT_ATTEMPT_TIMEOUT_MS") {
            pool.attempt_timeout = timeout;
        }
        if let Some(delay) = millis("CONDUIT_RETRY_DELAY_MS") {
            pool.retry_policy = RetryPolicy::fixed(delay);
        }
        if let Some(timeout) = millis("CONDUIT_SHUTDOWN_TIMEOUT_MS") {
            pool.shutdown_timeout = timeout;
        }

        let mut bucket = TokenBucketConfig::default();
        if let Some(capacity) = parse("CONDUIT_BUCKET_CAPACITY") {
            bucket.capacity = capacity;
        }
        if let Some(rate) = parse("CONDUIT_BUCKET_REFILL_PER_SEC") {
            bucket = bucket.with_refill(rate, Duration::from_secs(1));
        }

        let mut window = SlidingWindowConfig::default();
        if let Some(max) = parse("CONDUIT_WINDOW_MAX") {
            window.max_count = max;
        }
        if let Some(duration) = millis("CONDUIT_WINDOW_MS") {
            window.window = duration;
        }

        config.admission = match lookup("CONDUIT_ADMISSION").as_deref().map(str::trim) {
            Some("sliding_window") => AdmissionConfig::SlidingWindow(window),
            _ => AdmissionConfig::TokenBucket(bucket),
        };

        if let Some(threshold) = lookup("CONDUIT_CIRCUIT_THRESHOLD").and_then(|v| parse_value(&v))
        {
            config.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(reset) = millis("CONDUIT_CIRCUIT_RESET_MS") {
            config.circuit_breaker.reset_timeout = reset;
        }

        if let Some(buffer) = parse("CONDUIT_STAGE_BUFFER") {
            config.stage_buffer = buffer as usize;
        }
        if let Some(batch) = parse("CONDUIT_FAN_IN_BATCH") {
            config.fan_in.batch_size = batch as usize;
        }

        config
    }

    /// Parse configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RuntimeError::InvalidConfig(e.to_string()))
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.admission.validate()?;
        self.circuit_breaker.validate()?;
        self.pipeline.validate()?;
        if self.stage_buffer == 0 {
            return Err(RuntimeError::InvalidConfig(
                "stage_buffer must be positive".into(),
            ));
        }
        self.fan_out.validate()?;
        self.fan_in.validate()?;
        Ok(())
    }
}

fn parse_value<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for optional Duration as milliseconds
pub(crate) mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.strategy(), "token_bucket");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CONDUIT_WORKERS", "8"),
            ("CONDUIT_QUEUE_CAPACITY", "256"),
            ("CONDUIT_MAX_RETRIES", "2"),
            ("CONDUIT_ATTEMPT_TIMEOUT_MS", "1500"),
            ("CONDUIT_RETRY_DELAY_MS", "20"),
            ("CONDUIT_CIRCUIT_THRESHOLD", "7"),
            ("CONDUIT_CIRCUIT_RESET_MS", "250"),
            ("CONDUIT_STAGE_BUFFER", "16"),
            ("CONDUIT_FAN_IN_BATCH", "5"),
        ]));

        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.pool.queue_capacity, 256);
        assert_eq!(config.pool.max_retries, 2);
        assert_eq!(config.pool.attempt_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.pool.retry_policy.delay_for_attempt(2),
            Duration::from_millis(20)
        );
        assert_eq!(config.circuit_breaker.failure_threshold, 7);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_millis(250));
        assert_eq!(config.stage_buffer, 16);
        assert_eq!(config.fan_in.batch_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sliding_window_selection() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CONDUIT_ADMISSION", "sliding_window"),
            ("CONDUIT_WINDOW_MAX", "30"),
            ("CONDUIT_WINDOW_MS", "2000"),
        ]));

        match config.admission {
            AdmissionConfig::SlidingWindow(window) => {
                assert_eq!(window.max_count, 30);
                assert_eq!(window.window, Duration::from_secs(2));
            }
            other => panic!("expected sliding window, got {other:?}"),
        }
    }

    #[test]
    fn test_token_bucket_from_lookup() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CONDUIT_BUCKET_CAPACITY", "40"),
            ("CONDUIT_BUCKET_REFILL_PER_SEC", "4"),
        ]));

        assert_eq!(
            config.admission,
            AdmissionConfig::TokenBucket(TokenBucketConfig::per_second(40, 4))
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CONDUIT_WORKERS", "many"),
            ("CONDUIT_ATTEMPT_TIMEOUT_MS", "-5"),
        ]));
        let defaults = RuntimeConfig::default();

        assert_eq!(config.pool.workers, defaults.pool.workers);
        assert_eq!(config.pool.attempt_timeout, defaults.pool.attempt_timeout);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = RuntimeConfig::from_lookup(lookup(&[("CONDUIT_WORKERS", "0")]));
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_with_partial_input() {
        let config = RuntimeConfig::from_json(r#"{"stage_buffer": 8}"#).unwrap();
        assert_eq!(config.stage_buffer, 8);
        assert_eq!(config.pool, WorkerPoolConfig::default());

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_json(&json).unwrap(), config);

        assert!(RuntimeConfig::from_json("{not json").is_err());
    }
}
