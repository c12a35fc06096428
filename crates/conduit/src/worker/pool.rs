//! Worker pool for task execution
//!
//! Manages concurrent task execution with a bounded queue, per-attempt
//! timeouts, bounded retries and graceful shutdown.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::stats::{PoolStats, StatsRecorder};
use super::task::{Task, TaskContext, TaskHandle, TaskId};
use crate::config::duration_millis;
use crate::error::{Result, RuntimeError, TaskError};
use crate::lifecycle::{CancelSignal, LifecycleController};
use crate::reliability::RetryPolicy;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Pool name used in log output
    pub name: String,

    /// Concurrent executors
    pub workers: usize,

    /// Bounded queue capacity
    pub queue_capacity: usize,

    /// Default retries after the first attempt
    pub max_retries: u32,

    /// Default bound on each attempt
    #[serde(with = "duration_millis")]
    pub attempt_timeout: Duration,

    /// Default delay policy between attempts
    pub retry_policy: RetryPolicy,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Backpressure configuration
    pub backpressure: BackpressureConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            workers: 4,
            queue_capacity: 128,
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set default retries after the first attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set default per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set default retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set backpressure configuration
    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig(
                "pool needs at least one worker".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "queue_capacity must be positive".into(),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "attempt_timeout must be positive".into(),
            ));
        }
        self.retry_policy.validate()?;
        self.backpressure.validate()
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Created, workers not started; submissions queue up
    Idle,
    /// Workers are consuming the queue
    Running,
    /// Stop requested, finishing running tasks
    Draining,
    /// Terminal
    Stopped,
}

impl std::fmt::Display for WorkerPoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Everything a worker needs to run a job
#[derive(Clone)]
pub(crate) struct Execution {
    pool: Arc<str>,
    signal: CancelSignal,
    config: Arc<WorkerPoolConfig>,
    stats: Arc<StatsRecorder>,
}

/// Type-erased queued task
pub(crate) trait Job: Send {
    fn id(&self) -> TaskId;

    fn run(self: Box<Self>, exec: Execution) -> BoxFuture<'static, ()>;

    /// Resolve a task that will never run
    fn cancel(self: Box<Self>, stats: &StatsRecorder);
}

struct PendingTask<P, H, O> {
    task: Task<P, H>,
    reply: oneshot::Sender<Result<O>>,
}

impl<P, H, Fut, O> Job for PendingTask<P, H, O>
where
    P: Clone + Send + Sync + 'static,
    H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
    O: Send + 'static,
{
    fn id(&self) -> TaskId {
        self.task.id
    }

    fn run(self: Box<Self>, exec: Execution) -> BoxFuture<'static, ()> {
        let PendingTask { task, reply } = *self;
        Box::pin(async move {
            let result = execute(&task, &exec).await;
            // Submitter may have dropped the handle
            let _ = reply.send(result);
        })
    }

    fn cancel(self: Box<Self>, stats: &StatsRecorder) {
        stats.cancelled();
        let _ = self.reply.send(Err(RuntimeError::Cancelled));
    }
}

/// Retry loop for one task
///
/// Counters are updated before the result is published, so a caller that
/// observed the result also observes the counters.
async fn execute<P, H, Fut, O>(task: &Task<P, H>, exec: &Execution) -> Result<O>
where
    P: Clone,
    H: Fn(P, TaskContext) -> Fut,
    Fut: Future<Output = std::result::Result<O, TaskError>>,
{
    let config = &exec.config;
    let max_attempts = task
        .max_retries
        .unwrap_or(config.max_retries)
        .saturating_add(1);
    let attempt_timeout = task.attempt_timeout.unwrap_or(config.attempt_timeout);
    let policy = task.retry_policy.as_ref().unwrap_or(&config.retry_policy);
    let started = Instant::now();

    let mut attempt = 1;
    loop {
        let ctx = TaskContext::new(task.id, attempt, max_attempts, exec.signal.clone());
        // The handler is called inside the guarded future so a panic while
        // building it is caught too
        let attempt_future =
            AssertUnwindSafe(async { (task.handler)(task.payload.clone(), ctx).await })
                .catch_unwind();
        let outcome = tokio::time::timeout(attempt_timeout, attempt_future).await;

        let error = match outcome {
            Ok(Ok(Ok(output))) => {
                exec.stats.processed(started.elapsed());
                trace!(pool = %exec.pool, task_id = %task.id, attempt, "Task completed");
                return Ok(output);
            }
            Ok(Ok(Err(error))) => error,
            Ok(Err(panic)) => TaskError::panicked(&panic_message(panic.as_ref())),
            Err(_) => {
                exec.stats.timed_out();
                TaskError::timeout(attempt_timeout)
            }
        };

        if error.is_type(TaskError::CANCELLED) {
            exec.stats.cancelled();
            debug!(pool = %exec.pool, task_id = %task.id, attempt, "Task observed cancellation");
            return Err(RuntimeError::Cancelled);
        }

        let exhausted = attempt >= max_attempts;
        if exhausted || !error.retryable || !policy.should_retry(error.error_type.as_deref()) {
            exec.stats.failed();
            warn!(
                pool = %exec.pool,
                task_id = %task.id,
                attempts = attempt,
                error = %error,
                "Task failed"
            );
            return Err(RuntimeError::TaskFailed {
                task_id: task.id,
                attempts: attempt,
                source: error,
            });
        }

        if exec.signal.is_cancelled() {
            exec.stats.cancelled();
            return Err(RuntimeError::Cancelled);
        }

        let delay = policy.delay_for_attempt(attempt + 1);
        exec.stats.retried();
        debug!(
            pool = %exec.pool,
            task_id = %task.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying task"
        );

        tokio::select! {
            biased;
            _ = exec.signal.cancelled() => {
                exec.stats.cancelled();
                return Err(RuntimeError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>>;

struct WorkerSlot {
    index: usize,
    controller: LifecycleController,
}

/// Bounded pool of concurrent executors
///
/// # Example
///
/// ```
/// use conduit::worker::{Task, WorkerPool, WorkerPoolConfig};
/// use conduit::TaskError;
///
/// # #[tokio::main]
/// # async fn main() -> conduit::Result<()> {
/// let pool = WorkerPool::new(WorkerPoolConfig::new(2));
/// pool.start()?;
///
/// let handle = pool
///     .submit(Task::new(20u32, |n: u32, _ctx| async move { Ok::<_, TaskError>(n + 1) }))
///     .await?;
/// assert_eq!(handle.wait().await?, 21);
///
/// pool.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    name: Arc<str>,
    config: Arc<WorkerPoolConfig>,
    lifecycle: LifecycleController,
    sender: mpsc::Sender<Box<dyn Job>>,
    queue: JobQueue,
    stats: Arc<StatsRecorder>,
    backpressure: Arc<BackpressureState>,
    status: watch::Sender<WorkerPoolStatus>,
    workers: Mutex<Vec<WorkerSlot>>,
    next_worker: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with its own root lifecycle
    pub fn new(config: WorkerPoolConfig) -> Self {
        let lifecycle = LifecycleController::named(config.name.clone());
        Self::build(config, lifecycle)
    }

    /// Create a pool that is cancelled together with `parent`
    pub fn with_parent(config: WorkerPoolConfig, parent: &CancelSignal) -> Self {
        let lifecycle = LifecycleController::child_of(parent, config.name.clone());
        Self::build(config, lifecycle)
    }

    fn build(config: WorkerPoolConfig, lifecycle: LifecycleController) -> Self {
        // A zero capacity is rejected by `start`; the channel itself needs one slot
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.workers,
        ));
        let (status, _) = watch::channel(WorkerPoolStatus::Idle);

        Self {
            name: Arc::from(config.name.as_str()),
            config: Arc::new(config),
            lifecycle,
            sender,
            queue: Arc::new(tokio::sync::Mutex::new(receiver)),
            stats: Arc::new(StatsRecorder::default()),
            backpressure,
            status,
            workers: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Start the configured number of workers
    #[instrument(skip(self), fields(pool = %self.name))]
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;

        let mut result = Ok(());
        self.status.send_if_modified(|status| match *status {
            WorkerPoolStatus::Idle => {
                *status = WorkerPoolStatus::Running;
                true
            }
            WorkerPoolStatus::Running | WorkerPoolStatus::Draining => {
                result = Err(RuntimeError::AlreadyRunning);
                false
            }
            WorkerPoolStatus::Stopped => {
                result = Err(RuntimeError::NotRunning);
                false
            }
        });
        result?;

        for _ in 0..self.config.workers {
            self.spawn_worker();
        }

        info!(
            pool = %self.name,
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop the pool
    ///
    /// Running tasks finish, queued tasks resolve as cancelled. Returns
    /// [`RuntimeError::ShutdownTimeout`] if running tasks outlive
    /// `shutdown_timeout`; they are abandoned. Safe to call repeatedly.
    #[instrument(skip(self), fields(pool = %self.name))]
    pub async fn stop(&self) -> Result<()> {
        let mut previous = WorkerPoolStatus::Idle;
        self.status.send_if_modified(|status| {
            previous = *status;
            match *status {
                WorkerPoolStatus::Idle | WorkerPoolStatus::Running => {
                    *status = WorkerPoolStatus::Draining;
                    true
                }
                _ => false,
            }
        });

        match previous {
            WorkerPoolStatus::Stopped => return Ok(()),
            WorkerPoolStatus::Draining => {
                // Another caller is draining; wait for it to finish
                let mut status = self.status.subscribe();
                let _ = status.wait_for(|s| *s == WorkerPoolStatus::Stopped).await;
                return Ok(());
            }
            _ => {}
        }

        info!(pool = %self.name, "Initiating graceful shutdown");
        self.lifecycle.cancel();

        let cancelled = self.drain_queue().await;
        if cancelled > 0 {
            info!(pool = %self.name, cancelled, "Cancelled queued tasks");
        }

        let drained = self
            .lifecycle
            .wait_timeout(self.config.shutdown_timeout)
            .await;
        self.workers.lock().clear();
        self.status.send_replace(WorkerPoolStatus::Stopped);

        if drained {
            info!(pool = %self.name, "Worker pool stopped");
            Ok(())
        } else {
            warn!(
                pool = %self.name,
                remaining_tasks = self.stats.in_flight(),
                "Shutdown timeout reached, abandoning running tasks"
            );
            Err(RuntimeError::ShutdownTimeout)
        }
    }

    /// Enqueue a task, waiting for queue space
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Cancelled`] if the pool stops while waiting.
    pub async fn submit<P, H, Fut, O>(&self, task: Task<P, H>) -> Result<TaskHandle<O>>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        self.ensure_open()?;
        let pool_signal = self.lifecycle.signal();
        let permit = tokio::select! {
            biased;
            _ = pool_signal.cancelled() => return Err(RuntimeError::Cancelled),
            permit = self.sender.reserve() => permit.map_err(|_| RuntimeError::Cancelled)?,
        };
        Ok(self.enqueue(permit, task))
    }

    /// Enqueue a task, giving up when `caller` is cancelled
    pub async fn submit_with_cancel<P, H, Fut, O>(
        &self,
        task: Task<P, H>,
        caller: &CancelSignal,
    ) -> Result<TaskHandle<O>>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        self.ensure_open()?;
        let pool_signal = self.lifecycle.signal();
        let permit = tokio::select! {
            biased;
            _ = pool_signal.cancelled() => return Err(RuntimeError::Cancelled),
            _ = caller.cancelled() => return Err(RuntimeError::Cancelled),
            permit = self.sender.reserve() => permit.map_err(|_| RuntimeError::Cancelled)?,
        };
        Ok(self.enqueue(permit, task))
    }

    /// Enqueue a task, waiting at most `timeout` for queue space
    ///
    /// # Errors
    ///
    /// [`RuntimeError::QueueTimeout`] if the queue stayed full.
    pub async fn submit_timeout<P, H, Fut, O>(
        &self,
        task: Task<P, H>,
        timeout: Duration,
    ) -> Result<TaskHandle<O>>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        self.ensure_open()?;
        let pool_signal = self.lifecycle.signal();
        let permit = tokio::select! {
            biased;
            _ = pool_signal.cancelled() => return Err(RuntimeError::Cancelled),
            permit = self.sender.reserve() => permit.map_err(|_| RuntimeError::Cancelled)?,
            _ = tokio::time::sleep(timeout) => return Err(RuntimeError::QueueTimeout(timeout)),
        };
        Ok(self.enqueue(permit, task))
    }

    /// Enqueue a task only if there is queue space right now
    ///
    /// # Errors
    ///
    /// [`RuntimeError::QueueFull`] if the queue is full.
    pub fn try_submit<P, H, Fut, O>(&self, task: Task<P, H>) -> Result<TaskHandle<O>>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        self.ensure_open()?;
        let permit = self.sender.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => RuntimeError::QueueFull,
            mpsc::error::TrySendError::Closed(()) => RuntimeError::Cancelled,
        })?;
        Ok(self.enqueue(permit, task))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lifecycle.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        Ok(())
    }

    fn enqueue<P, H, Fut, O>(
        &self,
        permit: mpsc::Permit<'_, Box<dyn Job>>,
        task: Task<P, H>,
    ) -> TaskHandle<O>
    where
        P: Clone + Send + Sync + 'static,
        H: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
        O: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let id = task.id;
        let submitted_at = Utc::now();

        self.stats.submitted();
        permit.send(Box::new(PendingTask { task, reply }));
        trace!(pool = %self.name, task_id = %id, "Task queued");

        TaskHandle::new(id, submitted_at, result)
    }

    /// Resolve everything still queued as cancelled
    async fn drain_queue(&self) -> usize {
        let mut queue = self.queue.lock().await;
        queue.close();

        // Waits for submitters holding a reserved slot
        let mut cancelled = 0;
        while let Some(job) = queue.recv().await {
            trace!(pool = %self.name, task_id = %job.id(), "Cancelling queued task");
            job.cancel(&self.stats);
            cancelled += 1;
        }
        cancelled
    }

    /// Spawn one more worker loop
    pub(crate) fn spawn_worker(&self) -> usize {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let controller = self.lifecycle.child(format!("{}-worker-{}", self.name, index));

        let exec = Execution {
            pool: Arc::clone(&self.name),
            signal: self.lifecycle.signal(),
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
        };
        controller.spawn(worker_loop(
            index,
            Arc::clone(&self.queue),
            controller.signal(),
            Arc::clone(&self.backpressure),
            exec,
        ));

        let mut workers = self.workers.lock();
        workers.push(WorkerSlot { index, controller });
        self.backpressure.set_capacity(workers.len());
        index
    }

    /// Stop the most recently added worker after its current task
    pub(crate) fn retire_worker(&self) -> Option<usize> {
        let mut workers = self.workers.lock();
        let slot = workers.pop()?;
        slot.controller.cancel();
        self.backpressure.set_capacity(workers.len());
        debug!(pool = %self.name, worker = slot.index, "Retiring worker");
        Some(slot.index)
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.borrow()
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Live worker loops
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Tasks waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Busy workers
    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    /// Backpressure state shared with the workers
    pub fn backpressure(&self) -> &BackpressureState {
        &self.backpressure
    }

    /// Check if the pool is running and below its high watermark
    pub fn is_accepting(&self) -> bool {
        self.status() == WorkerPoolStatus::Running && self.backpressure.should_accept()
    }

    /// Cancellation signal handed to every handler
    pub fn signal(&self) -> CancelSignal {
        self.lifecycle.signal()
    }

    /// Pool configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("workers", &self.worker_count())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

async fn worker_loop(
    index: usize,
    queue: JobQueue,
    exit: CancelSignal,
    backpressure: Arc<BackpressureState>,
    exec: Execution,
) {
    debug!(pool = %exec.pool, worker = index, "Worker started");

    loop {
        let job = {
            let mut receiver = tokio::select! {
                biased;
                _ = exit.cancelled() => break,
                receiver = queue.lock() => receiver,
            };
            tokio::select! {
                biased;
                _ = exit.cancelled() => break,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        exec.stats.started();
        backpressure.task_started();
        job.run(exec.clone()).await;
        backpressure.task_completed();
        exec.stats.finished();
    }

    debug!(pool = %exec.pool, worker = index, "Worker exited");
}
