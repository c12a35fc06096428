//! Pipeline wiring and lifecycle

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument, trace};

use super::stage::{stage_worker, ErrorSink, SharedInput, Stage, StageStats, Transform};
use super::{PipelineConfig, StageFailure};
use crate::error::{Result, RuntimeError, TaskError};
use crate::lifecycle::{CancelSignal, LifecycleController};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineStatus {
    Idle,
    Running,
    Stopped,
}

/// A chain of transform stages over items of type `T`
///
/// Stages are added before [`start`](Self::start). Items fed through
/// [`input`](Self::input) come out of [`output`](Self::output) in FIFO order
/// when every stage has a single worker; with more workers per stage the
/// order across items is not preserved.
pub struct Pipeline<T> {
    name: Arc<str>,
    config: PipelineConfig,
    lifecycle: LifecycleController,
    stages: Vec<Arc<Stage<T>>>,
    status: Mutex<PipelineStatus>,
    input: Mutex<Option<mpsc::Sender<T>>>,
    output: Mutex<Option<mpsc::Receiver<T>>>,
    errors: Mutex<Option<mpsc::Receiver<StageFailure>>>,
    errors_dropped: Arc<AtomicU64>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Create a pipeline with its own root lifecycle
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> Self {
        let name = name.into();
        let lifecycle = LifecycleController::named(name.clone());
        Self::build(name, config, lifecycle)
    }

    /// Create a pipeline that stops together with `parent`
    pub fn with_parent(
        name: impl Into<String>,
        config: PipelineConfig,
        parent: &CancelSignal,
    ) -> Self {
        let name = name.into();
        let lifecycle = LifecycleController::child_of(parent, name.clone());
        Self::build(name, config, lifecycle)
    }

    fn build(name: String, config: PipelineConfig, lifecycle: LifecycleController) -> Self {
        Self {
            name: Arc::from(name.as_str()),
            config,
            lifecycle,
            stages: Vec::new(),
            status: Mutex::new(PipelineStatus::Idle),
            input: Mutex::new(None),
            output: Mutex::new(None),
            errors: Mutex::new(None),
            errors_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an asynchronous stage
    ///
    /// `buffer` is the capacity of this stage's output buffer.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AlreadyRunning`] after [`start`](Self::start),
    /// [`RuntimeError::InvalidConfig`] for zero workers or buffer.
    pub fn add_stage<F, Fut>(
        &mut self,
        name: impl Into<String>,
        workers: usize,
        buffer: usize,
        transform: F,
    ) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, TaskError>> + Send + 'static,
    {
        if *self.status.lock() != PipelineStatus::Idle {
            return Err(RuntimeError::AlreadyRunning);
        }
        let name = name.into();
        if workers == 0 || buffer == 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "stage {name} needs at least one worker and a positive buffer"
            )));
        }

        let transform: Transform<T> = Arc::new(move |item: T| transform(item).boxed());
        let index = self.stages.len();
        self.stages
            .push(Arc::new(Stage::new(name, index, workers, buffer, transform)));
        Ok(())
    }

    /// Append a synchronous stage
    pub fn add_sync_stage<F>(
        &mut self,
        name: impl Into<String>,
        workers: usize,
        buffer: usize,
        transform: F,
    ) -> Result<()>
    where
        F: Fn(T) -> std::result::Result<T, TaskError> + Send + Sync + 'static,
    {
        self.add_stage(name, workers, buffer, move |item| {
            std::future::ready(transform(item))
        })
    }

    /// Wire the stages and start every stage worker
    #[instrument(skip(self), fields(pipeline = %self.name))]
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;
        {
            let mut status = self.status.lock();
            match *status {
                PipelineStatus::Idle => *status = PipelineStatus::Running,
                PipelineStatus::Running => return Err(RuntimeError::AlreadyRunning),
                PipelineStatus::Stopped => return Err(RuntimeError::NotRunning),
            }
        }

        let (errors_tx, errors_rx) = mpsc::channel(self.config.error_capacity);
        *self.errors.lock() = Some(errors_rx);

        if self.stages.is_empty() {
            // Nothing to feed: output is an already-closed stream
            let (_, output_rx) = mpsc::channel(1);
            *self.output.lock() = Some(output_rx);
            info!(pipeline = %self.name, "Pipeline started with no stages");
            return Ok(());
        }

        let sink = ErrorSink::new(errors_tx, Arc::clone(&self.errors_dropped));
        let (input_tx, input_rx) = mpsc::channel(self.config.input_capacity);
        let mut upstream = input_rx;

        for stage in &self.stages {
            let shared: SharedInput<T> = Arc::new(tokio::sync::Mutex::new(upstream));
            let (tx, rx) = mpsc::channel(stage.buffer);
            for worker in 0..stage.workers {
                self.lifecycle.spawn(stage_worker(
                    Arc::clone(stage),
                    worker,
                    Arc::clone(&shared),
                    tx.clone(),
                    sink.clone(),
                    self.lifecycle.signal(),
                ));
            }
            upstream = rx;
        }

        *self.input.lock() = Some(input_tx);
        *self.output.lock() = Some(upstream);

        info!(
            pipeline = %self.name,
            stages = self.stages.len(),
            workers = self.stages.iter().map(|s| s.workers).sum::<usize>(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Feed one item into the first stage, waiting for buffer space
    ///
    /// With no stages the item is dropped.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotRunning`] before start, after
    /// [`close_input`](Self::close_input) or after stop;
    /// [`RuntimeError::Cancelled`] if the pipeline stops while waiting.
    pub async fn input(&self, item: T) -> Result<()> {
        let sender = self.sender()?;
        let Some(sender) = sender else {
            trace!(pipeline = %self.name, "No stages, dropping input");
            return Ok(());
        };

        let signal = self.lifecycle.signal();
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(RuntimeError::Cancelled),
            sent = sender.send(item) => sent.map_err(|_| RuntimeError::Cancelled),
        }
    }

    /// Feed one item only if the input buffer has room
    ///
    /// # Errors
    ///
    /// [`RuntimeError::QueueFull`] when the buffer is full, otherwise as
    /// [`input`](Self::input).
    pub fn try_input(&self, item: T) -> Result<()> {
        let Some(sender) = self.sender()? else {
            return Ok(());
        };
        sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RuntimeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RuntimeError::Cancelled,
        })
    }

    /// `Ok(None)` means the pipeline has no stages
    fn sender(&self) -> Result<Option<mpsc::Sender<T>>> {
        if *self.status.lock() != PipelineStatus::Running {
            return Err(RuntimeError::NotRunning);
        }
        if self.stages.is_empty() {
            return Ok(None);
        }
        self.input
            .lock()
            .clone()
            .map(Some)
            .ok_or(RuntimeError::NotRunning)
    }

    /// End a finite input
    ///
    /// Stages drain what is buffered, then close in order; the output stream
    /// ends after the last item.
    pub fn close_input(&self) {
        if self.input.lock().take().is_some() {
            info!(pipeline = %self.name, "Pipeline input closed");
        }
    }

    /// Output of the last stage; available once, after start
    pub fn output(&self) -> Option<ReceiverStream<T>> {
        self.output.lock().take().map(ReceiverStream::new)
    }

    /// Per-item transform failures; available once, after start
    ///
    /// The channel is bounded. Failures that do not fit are dropped and
    /// counted in [`errors_dropped`](Self::errors_dropped).
    pub fn errors(&self) -> Option<ReceiverStream<StageFailure>> {
        self.errors.lock().take().map(ReceiverStream::new)
    }

    /// Failures discarded because the error channel was full or gone
    pub fn errors_dropped(&self) -> u64 {
        self.errors_dropped.load(Ordering::Relaxed)
    }

    /// Counters of every stage, in order
    pub fn stage_stats(&self) -> Vec<StageStats> {
        self.stages.iter().map(|s| s.stats()).collect()
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Cancellation signal shared by all stage workers
    pub fn signal(&self) -> CancelSignal {
        self.lifecycle.signal()
    }

    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop all stages and wait for their workers to exit
    ///
    /// Items still buffered between stages are discarded. Safe to call
    /// repeatedly.
    #[instrument(skip(self), fields(pipeline = %self.name))]
    pub async fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.status.lock(), PipelineStatus::Stopped);
        if previous == PipelineStatus::Stopped {
            return Ok(());
        }

        self.input.lock().take();
        self.lifecycle.cancel();
        self.lifecycle.wait().await;

        info!(
            pipeline = %self.name,
            errors_dropped = self.errors_dropped(),
            "Pipeline stopped"
        );
        Ok(())
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("status", &*self.status.lock())
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn two_stage() -> Pipeline<i64> {
        let mut pipeline = Pipeline::new("test", PipelineConfig::default());
        pipeline
            .add_sync_stage("double", 1, 4, |n: i64| Ok(n * 2))
            .unwrap();
        pipeline
            .add_stage("increment", 1, 4, |n: i64| async move {
                Ok::<_, TaskError>(n + 1)
            })
            .unwrap();
        pipeline
    }

    #[tokio::test]
    async fn test_items_flow_through_stages_in_order() {
        let pipeline = two_stage();
        pipeline.start().unwrap();
        let output = pipeline.output().unwrap();

        for n in [1, 2, 3] {
            pipeline.input(n).await.unwrap();
        }
        pipeline.close_input();

        let results: Vec<i64> = output.collect().await;
        assert_eq!(results, vec![3, 5, 7]);

        let stats = pipeline.stage_stats();
        assert_eq!(stats[0].stage, "double");
        assert_eq!(stats[0].processed, 3);
        assert_eq!(stats[1].processed, 3);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_item_does_not_stall_stage() {
        let mut pipeline = Pipeline::new("odd-only", PipelineConfig::default());
        pipeline
            .add_sync_stage("reject-even", 1, 4, |n: i64| {
                if n % 2 == 0 {
                    Err(TaskError::non_retryable(format!("{n} is even")))
                } else {
                    Ok(n)
                }
            })
            .unwrap();
        pipeline.start().unwrap();
        let output = pipeline.output().unwrap();
        let errors = pipeline.errors().unwrap();

        for n in 1..=5 {
            pipeline.input(n).await.unwrap();
        }
        pipeline.close_input();

        let results: Vec<i64> = output.collect().await;
        assert_eq!(results, vec![1, 3, 5]);

        let failures: Vec<StageFailure> = errors.collect().await;
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.stage == "reject-even" && f.index == 0));
        assert_eq!(pipeline.stage_stats()[0].failed, 2);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_error_channel_drops_and_counts() {
        let mut pipeline =
            Pipeline::new("lossy", PipelineConfig::default().with_error_capacity(1));
        pipeline
            .add_sync_stage("fail", 1, 4, |_: i64| Err(TaskError::retryable("nope")))
            .unwrap();
        pipeline.start().unwrap();
        let output = pipeline.output().unwrap();

        for n in 0..3 {
            pipeline.input(n).await.unwrap();
        }
        pipeline.close_input();

        assert!(output.collect::<Vec<_>>().await.is_empty());
        assert_eq!(pipeline.errors_dropped(), 2);
        assert_eq!(pipeline.errors().unwrap().collect::<Vec<_>>().await.len(), 1);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_stages() {
        let pipeline: Pipeline<i64> = Pipeline::new("empty", PipelineConfig::default());
        pipeline.start().unwrap();

        pipeline.input(1).await.unwrap();
        let output: Vec<i64> = pipeline.output().unwrap().collect().await;
        assert!(output.is_empty());
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let mut pipeline = two_stage();
        assert!(matches!(pipeline.input(1).await, Err(RuntimeError::NotRunning)));

        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.add_sync_stage("late", 1, 1, Ok),
            Err(RuntimeError::AlreadyRunning)
        ));
        assert!(matches!(pipeline.start(), Err(RuntimeError::AlreadyRunning)));
        assert!(pipeline.output().is_some());
        assert!(pipeline.output().is_none());

        pipeline.stop().await.unwrap();
        pipeline.stop().await.unwrap();
        assert!(matches!(pipeline.input(1).await, Err(RuntimeError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_stage_rejected() {
        let mut pipeline: Pipeline<i64> = Pipeline::new("bad", PipelineConfig::default());
        assert!(matches!(
            pipeline.add_sync_stage("no-workers", 0, 1, Ok),
            Err(RuntimeError::InvalidConfig(_))
        ));
        assert_eq!(pipeline.stage_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_unblocks_backpressured_input() {
        let mut pipeline: Pipeline<i64> =
            Pipeline::new("blocked", PipelineConfig::default().with_input_capacity(1));
        pipeline.add_sync_stage("pass", 1, 1, Ok).unwrap();
        let pipeline = Arc::new(pipeline);
        pipeline.start().unwrap();

        // Output is never consumed, so the chain fills up
        let producer = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                for n in 0..100i64 {
                    pipeline.input(n).await?;
                }
                Ok::<_, RuntimeError>(())
            })
        };
        while pipeline.try_input(-1).is_ok() {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(5), pipeline.stop())
            .await
            .unwrap()
            .unwrap();
        let result = producer.await.unwrap();
        assert!(matches!(
            result,
            Err(RuntimeError::Cancelled) | Err(RuntimeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_parallel_stage_preserves_count() {
        let mut pipeline: Pipeline<i64> = Pipeline::new("wide", PipelineConfig::default());
        pipeline
            .add_stage("square", 4, 8, |n: i64| async move {
                tokio::task::yield_now().await;
                Ok::<_, TaskError>(n * n)
            })
            .unwrap();
        let pipeline = Arc::new(pipeline);
        pipeline.start().unwrap();
        let output = pipeline.output().unwrap();

        let producer = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                for n in 0..50 {
                    pipeline.input(n).await.unwrap();
                }
                pipeline.close_input();
            })
        };

        let mut results: Vec<i64> = output.collect().await;
        producer.await.unwrap();
        results.sort_unstable();
        assert_eq!(results, (0..50).map(|n| n * n).collect::<Vec<_>>());
        pipeline.stop().await.unwrap();
    }
}
