//! Sliding window limiter

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Admission;
use crate::config::duration_millis;
use crate::error::{Result, RuntimeError};

/// Sliding window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Maximum admitted cost inside any window
    pub max_count: u64,

    /// Window length
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(1))
    }
}

impl SlidingWindowConfig {
    /// Create a new configuration
    pub fn new(max_count: u64, window: Duration) -> Self {
        Self { max_count, window }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_count == 0 {
            return Err(RuntimeError::InvalidConfig(
                "sliding window max_count must be positive".into(),
            ));
        }
        if self.window.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "sliding window duration must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WindowState {
    /// Admission times with their cost, oldest first
    events: VecDeque<(Instant, u64)>,
    /// Sum of costs in `events`
    total: u64,
}

/// Sliding window rate limiter
///
/// An event stops counting once `now - event_time >= window`.
#[derive(Debug)]
pub struct SlidingWindow {
    config: SlidingWindowConfig,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// Create an empty window
    pub fn new(config: SlidingWindowConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Configuration this window was built from
    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Cost admitted within the current window
    pub fn in_window(&self) -> u64 {
        let mut state = self.state.lock();
        self.prune(&mut state, Instant::now());
        state.total
    }

    pub(crate) fn allow_at(&self, cost: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.prune(&mut state, now);

        if state.total.saturating_add(cost) > self.config.max_count {
            return false;
        }
        if cost > 0 {
            state.events.push_back((now, cost));
            state.total += cost;
        }
        true
    }

    fn prune(&self, state: &mut WindowState, now: Instant) {
        while let Some(&(at, cost)) = state.events.front() {
            if now.saturating_duration_since(at) < self.config.window {
                break;
            }
            state.events.pop_front();
            state.total -= cost;
        }
    }
}

#[async_trait]
impl Admission for SlidingWindow {
    fn allow(&self, cost: u64) -> bool {
        self.allow_at(cost, Instant::now())
    }

    fn admissible(&self, cost: u64) -> bool {
        cost <= self.config.max_count
    }
}
