//! Multi-stage streaming pipelines
//!
//! This module provides:
//! - [`Pipeline`] - ordered stages linked by bounded buffers
//! - [`PipelineConfig`] - input and error channel capacities
//! - [`StageFailure`] / [`StageStats`] - per-item errors and per-stage counters
//!
//! # Data flow
//!
//! ```text
//!  input() ──▶ [input buf] ──▶ stage 0 ──▶ [buf 0] ──▶ stage 1 ──▶ [buf 1] ──▶ output()
//!                              (n workers)             (m workers)
//!                                  │                       │
//!                                  └───────────┬───────────┘
//!                                              ▼
//!                                    errors() (bounded, lossy)
//! ```
//!
//! A stage owns the buffer on its output side. The buffer closes once every
//! worker of the stage has exited, which in turn ends the next stage. A full
//! downstream buffer blocks the upstream workers.
//!
//! # Example
//!
//! ```
//! use conduit::pipeline::{Pipeline, PipelineConfig};
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> conduit::Result<()> {
//! let mut pipeline = Pipeline::new("numbers", PipelineConfig::default());
//! pipeline.add_sync_stage("double", 1, 8, |n: u64| Ok(n * 2))?;
//! pipeline.add_sync_stage("increment", 1, 8, |n: u64| Ok(n + 1))?;
//! pipeline.start()?;
//!
//! let output = pipeline.output().expect("output taken once");
//! for n in [1, 2, 3] {
//!     pipeline.input(n).await?;
//! }
//! pipeline.close_input();
//!
//! let results: Vec<u64> = output.collect().await;
//! assert_eq!(results, vec![3, 5, 7]);
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```

mod engine;
mod stage;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError, TaskError};

pub use engine::Pipeline;
pub use stage::StageStats;

/// Pipeline channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the buffer feeding the first stage
    pub input_capacity: usize,

    /// Capacity of the error side channel
    pub error_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_capacity: 64,
            error_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Set the input buffer capacity
    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    /// Set the error channel capacity
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "input_capacity must be positive".into(),
            ));
        }
        if self.error_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "error_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A transform error reported on the side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Stage that rejected the item
    pub stage: String,
    /// Zero-based position of the stage
    pub index: usize,
    /// Error returned by the transform
    pub error: TaskError,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} ({}): {}", self.stage, self.index, self.error)
    }
}
