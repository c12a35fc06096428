//! Error taxonomy for the runtime
//!
//! Two layers:
//! - [`TaskError`] is what a handler returns from a single attempt.
//! - [`RuntimeError`] is what the runtime surfaces to callers of its blocking
//!   and lifecycle operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::worker::TaskId;

/// Result alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Error type for a failed task attempt
///
/// Handlers return this from each attempt. Retryable errors are retried
/// according to the task's retry budget; non-retryable errors end the
/// task immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl TaskError {
    /// Error type recorded for attempts that exceeded their timeout
    pub const TIMEOUT: &'static str = "timeout";

    /// Error type recorded when a guarding circuit breaker rejected the attempt
    pub const CIRCUIT_OPEN: &'static str = "circuit_open";

    /// Error type recorded when the handler observed cancellation
    pub const CANCELLED: &'static str = "cancelled";

    /// Error type recorded when the handler panicked
    pub const PANICKED: &'static str = "panicked";

    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Error for an attempt that ran past its per-attempt timeout
    pub fn timeout(limit: Duration) -> Self {
        Self::retryable(format!("attempt timed out after {limit:?}")).with_type(Self::TIMEOUT)
    }

    /// Error for an attempt aborted because the task was cancelled
    pub fn cancelled() -> Self {
        Self::non_retryable("task cancelled").with_type(Self::CANCELLED)
    }

    /// Error for an attempt whose handler panicked
    pub fn panicked(message: &str) -> Self {
        Self::non_retryable(format!("handler panicked: {message}")).with_type(Self::PANICKED)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Check whether this error carries the given type
    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(kind) => write!(f, "{} ({})", self.message, kind),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::retryable(message)
    }
}

/// Errors surfaced by the runtime
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Handler kept failing until the retry budget was exhausted
    #[error("task {task_id} failed after {attempts} attempt(s): {source}")]
    TaskFailed {
        /// Task that failed
        task_id: TaskId,
        /// Attempts made, including the first
        attempts: u32,
        /// Error from the last attempt
        #[source]
        source: TaskError,
    },

    /// Operation aborted because shutdown was requested
    #[error("operation cancelled")]
    Cancelled,

    /// Queue was full and the caller asked not to wait
    #[error("queue is full")]
    QueueFull,

    /// Queue stayed full for the whole admission timeout
    #[error("queue stayed full for {0:?}")]
    QueueTimeout(Duration),

    /// Admission control denied the request
    #[error("rate limited")]
    RateLimited,

    /// Downstream presumed unhealthy
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Component already started
    #[error("already running")]
    AlreadyRunning,

    /// Component not started (or already stopped)
    #[error("not running")]
    NotRunning,

    /// Graceful shutdown did not finish in time; remaining work was abandoned
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RuntimeError {
    /// Whether this error means the operation was aborted by shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error is an admission denial (nothing was enqueued)
    pub fn is_admission_denied(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::QueueTimeout(_) | Self::RateLimited | Self::CircuitOpen
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_constructors() {
        let err = TaskError::retryable("boom");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "boom");

        let err = TaskError::non_retryable("bad input").with_type("validation");
        assert!(!err.retryable);
        assert!(err.is_type("validation"));
        assert_eq!(err.to_string(), "bad input (validation)");
    }

    #[test]
    fn test_timeout_error_is_retryable() {
        let err = TaskError::timeout(Duration::from_millis(50));
        assert!(err.retryable);
        assert!(err.is_type(TaskError::TIMEOUT));
    }

    #[test]
    fn test_cancelled_error_is_terminal() {
        let err = TaskError::cancelled();
        assert!(!err.retryable);
        assert!(err.is_type(TaskError::CANCELLED));
    }

    #[test]
    fn test_runtime_error_classification() {
        assert!(RuntimeError::Cancelled.is_cancelled());
        assert!(RuntimeError::RateLimited.is_admission_denied());
        assert!(RuntimeError::QueueTimeout(Duration::from_secs(1)).is_admission_denied());
        assert!(!RuntimeError::ShutdownTimeout.is_admission_denied());
    }

    #[test]
    fn test_task_failed_display() {
        let id = TaskId::new();
        let err = RuntimeError::TaskFailed {
            task_id: id,
            attempts: 3,
            source: TaskError::retryable("downstream 503"),
        };
        assert_eq!(
            err.to_string(),
            format!("task {id} failed after 3 attempt(s): downstream 503")
        );
    }

    #[test]
    fn test_task_error_serialization() {
        let err = TaskError::non_retryable("nope").with_type("auth");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
    }
}
