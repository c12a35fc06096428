//! Task model
//!
//! A [`Task`] pairs an opaque payload with a handler. Once submitted it is
//! owned by the pool until it reaches a terminal state; the submitter keeps a
//! [`TaskHandle`] to observe that state.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Result, RuntimeError, TaskError};
use crate::lifecycle::CancelSignal;
use crate::reliability::RetryPolicy;

/// Unique task identifier (UUID v7, time ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-attempt context handed to the handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    attempt: u32,
    max_attempts: u32,
    signal: CancelSignal,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
        signal: CancelSignal,
    ) -> Self {
        Self {
            task_id,
            attempt,
            max_attempts,
            signal,
        }
    }

    /// Task being executed
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Current attempt, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Total attempts allowed (`max_retries + 1`)
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a failure now would be final
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Check if shutdown was requested
    ///
    /// Long-running handlers should check this periodically.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once shutdown is requested
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }

    /// The cancellation signal for nested blocking calls
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }
}

/// A unit of work
///
/// `max_retries`, `attempt_timeout` and `retry_policy` default to the pool's
/// configuration when not set on the task.
///
/// # Example
///
/// ```
/// use conduit::worker::Task;
/// use conduit::TaskError;
/// use std::time::Duration;
///
/// let task = Task::new(21u64, |n: u64, _ctx| async move { Ok::<_, TaskError>(n * 2) })
///     .with_max_retries(2)
///     .with_attempt_timeout(Duration::from_secs(1));
/// assert_eq!(task.max_retries(), Some(2));
/// ```
pub struct Task<P, H> {
    pub(crate) id: TaskId,
    pub(crate) payload: P,
    pub(crate) handler: H,
    pub(crate) max_retries: Option<u32>,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) retry_policy: Option<RetryPolicy>,
}

impl<P, H> Task<P, H> {
    /// Create a task with a fresh id
    pub fn new<O, Fut>(payload: P, handler: H) -> Self
    where
        H: Fn(P, TaskContext) -> Fut,
        Fut: Future<Output = std::result::Result<O, TaskError>>,
    {
        Self {
            id: TaskId::new(),
            payload,
            handler,
            max_retries: None,
            attempt_timeout: None,
            retry_policy: None,
        }
    }

    /// Override the generated id
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Retries after the first attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Bound on each individual attempt
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Delay policy between attempts
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Payload passed to every attempt
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Retry override, if any
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Replace the handler, keeping id and overrides
    pub(crate) fn map_handler<H2>(self, wrap: impl FnOnce(H) -> H2) -> Task<P, H2> {
        Task {
            id: self.id,
            payload: self.payload,
            handler: wrap(self.handler),
            max_retries: self.max_retries,
            attempt_timeout: self.attempt_timeout,
            retry_policy: self.retry_policy,
        }
    }
}

impl<P: std::fmt::Debug, H> std::fmt::Debug for Task<P, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("max_retries", &self.max_retries)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

/// Handle to a submitted task
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<O> {
    id: TaskId,
    submitted_at: DateTime<Utc>,
    result: oneshot::Receiver<Result<O>>,
}

impl<O> TaskHandle<O> {
    pub(crate) fn new(
        id: TaskId,
        submitted_at: DateTime<Utc>,
        result: oneshot::Receiver<Result<O>>,
    ) -> Self {
        Self {
            id,
            submitted_at,
            result,
        }
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// When the task entered the queue
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Wait for the terminal result
    ///
    /// # Errors
    ///
    /// [`RuntimeError::TaskFailed`] once retries are exhausted,
    /// [`RuntimeError::Cancelled`] if the pool stopped first or abandoned
    /// the task at the shutdown deadline.
    pub async fn wait(self) -> Result<O> {
        self.result.await.unwrap_or(Err(RuntimeError::Cancelled))
    }

    /// Non-blocking check; `None` while the task is still pending
    pub fn try_result(&mut self) -> Option<Result<O>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RuntimeError::Cancelled)),
        }
    }
}
