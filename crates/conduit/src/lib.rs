//! # Conduit
//!
//! A bounded, cancellation-aware task execution runtime for Tokio.
//!
//! ## Features
//!
//! - **Worker pools**: bounded queue, per-attempt timeouts, retry policies, graceful drain
//! - **Pipelines**: ordered stages linked by bounded buffers with an error side channel
//! - **Fan-out / fan-in**: split a stream across branches and merge them back in batches
//! - **Admission control**: token bucket and sliding window limiters
//! - **Circuit breakers**: fail fast while a dependency is unhealthy
//! - **Lifecycle**: hierarchical cancellation with in-flight tracking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LifecycleController                       │
//! │  (cancellation signal + in-flight counter, hierarchical)    │
//! └─────────────────────────────────────────────────────────────┘
//!          │ signal                │ signal              │ signal
//!          ▼                       ▼                     ▼
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │   GuardedPool    │   │     Pipeline     │   │ fan_out / fan_in │
//! │ Admission gate   │   │ stage ▶ stage ▶  │   │ branches, batch  │
//! │ CircuitBreaker   │   │ errors()         │   │ merge            │
//! └────────┬─────────┘   └──────────────────┘   └──────────────────┘
//!          ▼
//! ┌──────────────────┐
//! │    WorkerPool    │
//! │ queue ▶ workers  │
//! │ retry / timeout  │
//! └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use conduit::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> conduit::Result<()> {
//! let root = LifecycleController::new();
//! let pool = WorkerPool::with_parent(WorkerPoolConfig::new(4), &root.signal());
//! pool.start()?;
//!
//! let handle = pool
//!     .submit(Task::new("hello".to_string(), |s: String, _ctx| async move {
//!         Ok::<_, TaskError>(s.len())
//!     }))
//!     .await?;
//! assert_eq!(handle.wait().await?, 5);
//!
//! pool.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::admission::{
        Admission, AdmissionConfig, SlidingWindow, SlidingWindowConfig, TokenBucket,
        TokenBucketConfig,
    };
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{Result, RuntimeError, TaskError};
    pub use crate::fanout::{fan_in, fan_out, Distribution, FanInConfig, FanOutConfig};
    pub use crate::lifecycle::{CancelSignal, LifecycleController};
    pub use crate::pipeline::{Pipeline, PipelineConfig, StageFailure};
    pub use crate::reliability::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, RetryPolicy,
    };
    pub use crate::worker::{
        GuardedPool, PoolStats, Task, TaskContext, TaskHandle, TaskId, WorkerPool,
        WorkerPoolConfig,
    };
}

// Re-export key types at crate root
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError, TaskError};
pub use lifecycle::{CancelSignal, LifecycleController};
pub use worker::{Task, TaskHandle, WorkerPool, WorkerPoolConfig};
