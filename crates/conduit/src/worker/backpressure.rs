//! Backpressure tracking for worker pools
//!
//! The bounded queue already blocks submitters when the pool is saturated.
//! This state adds an advisory signal on top of it: the ratio of busy workers,
//! with high/low watermark hysteresis, used by callers that prefer to shed
//! load early and by [`LoadMonitor`](super::LoadMonitor) to resize the pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use conduit::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// High watermark - stop accepting when busy workers reach this ratio
    /// (e.g., 0.9 = 90% of workers)
    pub high_watermark: f64,

    /// Low watermark - resume accepting when busy workers drop to this ratio
    /// (e.g., 0.7 = 70% of workers)
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    /// Create a new backpressure configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the high watermark
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.low_watermark >= self.high_watermark {
            return Err(RuntimeError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure state for a pool
///
/// Tracks busy workers against the current worker count. Lock-free except
/// for the human-readable reason.
#[derive(Debug)]
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    capacity: AtomicUsize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    /// Create a new backpressure state
    pub fn new(config: BackpressureConfig, capacity: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Re-evaluate and return whether new work should be accepted
    ///
    /// Implements hysteresis using high/low watermarks to prevent oscillation.
    pub fn should_accept(&self) -> bool {
        let load_ratio = self.load_ratio();

        if self.accepting.load(Ordering::Relaxed) {
            if load_ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "load ratio {:.1}% exceeds high watermark",
                    load_ratio * 100.0
                ));
                return false;
            }
            true
        } else {
            if load_ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    /// Busy workers
    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    /// Worker count the load is measured against
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Update the worker count after a resize
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Get the load ratio (busy / workers)
    pub fn load_ratio(&self) -> f64 {
        self.current_load() as f64 / self.capacity().max(1) as f64
    }

    /// Whether the last evaluation accepted work
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Get the backpressure reason (if any)
    pub fn backpressure_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Record that a worker picked up a task
    pub fn task_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a worker finished a task
    pub fn task_completed(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
    }
}
