//! Admission-gated, circuit-guarded submission
//!
//! [`GuardedPool`] sits in front of a [`WorkerPool`]. The admission gate is
//! consulted once per submission; the circuit breaker wraps every handler
//! attempt, so retries see the circuit open and stop instead of hammering a
//! failing dependency.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::pool::WorkerPool;
use super::task::{Task, TaskContext, TaskHandle};
use crate::admission::Admission;
use crate::error::{Result, RuntimeError, TaskError};
use crate::reliability::CircuitBreaker;

type GuardedFuture<O> = BoxFuture<'static, std::result::Result<O, TaskError>>;

/// A worker pool behind optional admission control and a circuit breaker
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use conduit::admission::{TokenBucket, TokenBucketConfig};
/// use conduit::reliability::{CircuitBreaker, CircuitBreakerConfig};
/// use conduit::worker::{GuardedPool, Task, WorkerPool, WorkerPoolConfig};
/// use conduit::TaskError;
///
/// # #[tokio::main]
/// # async fn main() -> conduit::Result<()> {
/// let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new(2)));
/// pool.start()?;
///
/// let guarded = GuardedPool::new(Arc::clone(&pool))
///     .with_admission(Arc::new(TokenBucket::new(TokenBucketConfig::per_second(10, 10))))
///     .with_circuit_breaker(Arc::new(CircuitBreaker::new(
///         "downstream",
///         CircuitBreakerConfig::default(),
///     )));
///
/// let handle = guarded
///     .submit(Task::new(1u32, |n: u32, _ctx| async move { Ok::<_, TaskError>(n) }))
///     .await?;
/// assert_eq!(handle.wait().await?, 1);
///
/// pool.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GuardedPool {
    pool: Arc<WorkerPool>,
    admission: Option<Arc<dyn Admission>>,
    admission_timeout: Option<Duration>,
    cost: u64,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl GuardedPool {
    /// Wrap `pool` with no gate and no breaker
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            admission: None,
            admission_timeout: None,
            cost: 1,
            breaker: None,
        }
    }

    /// Gate submissions on `admission`
    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Wait up to `timeout` for admission in [`submit`](Self::submit)
    ///
    /// Without it the gate never waits.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = Some(timeout);
        self
    }

    /// Admission cost charged per task (default 1)
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Run every handler attempt through `breaker`
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// The wrapped pool
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The circuit breaker, if any
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Admit, then enqueue waiting for queue space
    ///
    /// # Errors
    ///
    /// [`RuntimeError::RateLimited`] if admission is denied; otherwise as
    /// [`WorkerPool::submit`].
    pub async fn submit<P, H, Fut, O>(&self, task: Task<P, H>) -> Result<TaskHandle<O>>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        if let Some(admission) = &self.admission {
            match self.admission_timeout {
                Some(timeout) => {
                    admission
                        .acquire(self.cost, timeout, &self.pool.signal())
                        .await?
                }
                None => self.admit_now(admission.as_ref())?,
            }
        }
        self.pool.submit(self.guard(task)).await
    }

    /// Admit and enqueue without waiting for either
    ///
    /// # Errors
    ///
    /// [`RuntimeError::RateLimited`] or [`RuntimeError::QueueFull`].
    pub fn try_submit<P, H, Fut, O>(&self, task: Task<P, H>) -> Result<TaskHandle<O>>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        if let Some(admission) = &self.admission {
            self.admit_now(admission.as_ref())?;
        }
        self.pool.try_submit(self.guard(task))
    }

    fn admit_now(&self, admission: &dyn Admission) -> Result<()> {
        if admission.allow(self.cost) {
            Ok(())
        } else {
            debug!(pool = %self.pool.name(), cost = self.cost, "Submission rate limited");
            Err(RuntimeError::RateLimited)
        }
    }

    fn guard<P, H, Fut, O>(
        &self,
        task: Task<P, H>,
    ) -> Task<P, impl Fn(P, TaskContext) -> GuardedFuture<O> + Send + Sync + 'static>
    where
        P: Send + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        let breaker = self.breaker.clone();
        task.map_handler(move |handler| {
            let handler = Arc::new(handler);
            move |payload: P, ctx: TaskContext| -> GuardedFuture<O> {
                match breaker.clone() {
                    None => (*handler)(payload, ctx).boxed(),
                    Some(breaker) => {
                        let handler = Arc::clone(&handler);
                        async move {
                            let Ok(permit) = breaker.allow() else {
                                return Err(TaskError::non_retryable(format!(
                                    "circuit breaker {} is open",
                                    breaker.name()
                                ))
                                .with_type(TaskError::CIRCUIT_OPEN));
                            };
                            // A timed-out attempt drops the permit, which counts as a failure
                            let result = (*handler)(payload, ctx).await;
                            match &result {
                                Ok(_) => permit.success(),
                                // Shutdown says nothing about the downstream
                                Err(e) if e.is_type(TaskError::CANCELLED) => permit.release(),
                                Err(_) => permit.failure(),
                            }
                            result
                        }
                        .boxed()
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for GuardedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedPool")
            .field("pool", &self.pool)
            .field("admission", &self.admission.is_some())
            .field("admission_timeout", &self.admission_timeout)
            .field("breaker", &self.breaker)
            .finish()
    }
}
