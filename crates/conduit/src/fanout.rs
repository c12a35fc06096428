//! Fan-out / fan-in over async streams
//!
//! [`fan_out`] splits one input stream into several independently processed
//! branches; [`fan_in`] merges several streams into one, batching items and
//! reducing each batch with a merge function.
//!
//! ```text
//!                ┌──▶ branch 0 ──┐
//!   input ──────▶├──▶ branch 1 ──┤──▶ fan_in ──▶ merge(batch) ──▶ output
//!   (dispatch)   └──▶ branch 2 ──┘    (batch_size / flush_interval)
//! ```
//!
//! # Ordering
//!
//! Neither side preserves ordering across branches. A branch may see items
//! out of input order ([`Distribution::Shared`]), and the merged stream
//! interleaves branches in whatever order items become ready. Callers that
//! need ordering must tag items with a sequence number and re-sort.
//!
//! # Completion
//!
//! Branches end when the input ends. The merged stream ends after every
//! source stream has ended and the trailing partial batch, if any, was
//! emitted exactly once. On cancellation the partial batch is merged and
//! emitted if the output has room, then the stream ends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use crate::config::duration_millis_opt;
use crate::error::{Result, RuntimeError};
use crate::lifecycle::CancelSignal;

type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// How input items are assigned to branches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// A dispatcher hands items to branches in turn
    #[default]
    RoundRobin,
    /// Branches pull from the input as they become free
    Shared,
}

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FanOutConfig {
    /// Number of branches
    pub workers: usize,

    /// Capacity of each branch's buffers
    pub capacity: usize,

    /// Assignment strategy
    pub distribution: Distribution,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 64,
            distribution: Distribution::RoundRobin,
        }
    }
}

impl FanOutConfig {
    /// Create a configuration with `workers` branches
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the per-branch buffer capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the distribution strategy
    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig(
                "fan-out needs at least one branch".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "fan-out capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Fan-in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FanInConfig {
    /// Items per merged batch
    pub batch_size: usize,

    /// Capacity of the merged output
    pub capacity: usize,

    /// Emit a partial batch once its oldest item has waited this long
    #[serde(with = "duration_millis_opt")]
    pub flush_interval: Option<Duration>,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            capacity: 64,
            flush_interval: None,
        }
    }
}

impl FanInConfig {
    /// Create a configuration with the given batch size
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }

    /// Set the output capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enable time-based flushing of partial batches
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "batch_size must be positive".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "fan-in capacity must be positive".into(),
            ));
        }
        if self.flush_interval.is_some_and(|d| d.is_zero()) {
            return Err(RuntimeError::InvalidConfig(
                "flush_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Split `input` into `config.workers` branches, each applying `process`
///
/// Each returned stream is one branch. Branch tasks are tracked as in-flight
/// work of `signal`'s owner and stop on cancellation. A branch whose stream
/// is dropped stops receiving items; the rest keep going.
///
/// # Example
///
/// ```
/// use conduit::fanout::{fan_out, FanOutConfig};
/// use conduit::lifecycle::LifecycleController;
/// use futures::{stream, StreamExt};
///
/// # #[tokio::main]
/// # async fn main() -> conduit::Result<()> {
/// let root = LifecycleController::new();
/// let branches = fan_out(
///     stream::iter(1..=6u32),
///     FanOutConfig::new(3),
///     &root.signal(),
///     |n| async move { n * 10 },
/// )?;
///
/// let mut total = 0;
/// for branch in branches {
///     total += branch.collect::<Vec<_>>().await.iter().sum::<u32>();
/// }
/// assert_eq!(total, 210);
/// # Ok(())
/// # }
/// ```
pub fn fan_out<S, T, U, F, Fut>(
    input: S,
    config: FanOutConfig,
    signal: &CancelSignal,
    process: F,
) -> Result<Vec<ReceiverStream<U>>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = U> + Send + 'static,
{
    config.validate()?;
    let process = Arc::new(process);
    let input: BoxStream<T> = Box::pin(input);
    let mut outputs = Vec::with_capacity(config.workers);

    match config.distribution {
        Distribution::RoundRobin => {
            let mut queues = Vec::with_capacity(config.workers);
            for branch in 0..config.workers {
                let (queue_tx, queue_rx) = mpsc::channel(config.capacity);
                let (out_tx, out_rx) = mpsc::channel(config.capacity);
                queues.push(queue_tx);
                signal.spawn(branch_worker(
                    branch,
                    ReceiverStream::new(queue_rx),
                    out_tx,
                    Arc::clone(&process),
                    signal.clone(),
                ));
                outputs.push(ReceiverStream::new(out_rx));
            }
            signal.spawn(dispatch(input, queues, signal.clone()));
        }
        Distribution::Shared => {
            let shared = Arc::new(tokio::sync::Mutex::new(input));
            for branch in 0..config.workers {
                let (out_tx, out_rx) = mpsc::channel(config.capacity);
                let source = Arc::clone(&shared);
                // Each pull locks the input for one item only
                let pulled = stream::unfold(source, |source| async move {
                    let item = source.lock().await.next().await;
                    item.map(|item| (item, source))
                });
                signal.spawn(branch_worker(
                    branch,
                    Box::pin(pulled),
                    out_tx,
                    Arc::clone(&process),
                    signal.clone(),
                ));
                outputs.push(ReceiverStream::new(out_rx));
            }
        }
    }

    debug!(
        branches = config.workers,
        distribution = ?config.distribution,
        "Fan-out started"
    );
    Ok(outputs)
}

/// Round-robin dispatcher; skips branches whose consumer is gone
async fn dispatch<T: Send>(
    mut input: BoxStream<T>,
    mut queues: Vec<mpsc::Sender<T>>,
    signal: CancelSignal,
) {
    let mut next = 0;
    'items: loop {
        let item = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            item = input.next() => item,
        };
        let Some(mut item) = item else {
            break;
        };

        while !queues.is_empty() {
            let branch = next % queues.len();
            let sent = tokio::select! {
                biased;
                _ = signal.cancelled() => break 'items,
                sent = queues[branch].send(item) => sent,
            };
            match sent {
                Ok(()) => {
                    next = branch + 1;
                    continue 'items;
                }
                Err(mpsc::error::SendError(returned)) => {
                    trace!(branch, "Fan-out branch closed, skipping");
                    queues.remove(branch);
                    next = branch;
                    item = returned;
                }
            }
        }
        debug!("Every fan-out branch closed, stopping dispatch");
        break;
    }
    trace!("Fan-out dispatch finished");
}

async fn branch_worker<S, T, U, F, Fut>(
    branch: usize,
    mut source: S,
    output: mpsc::Sender<U>,
    process: Arc<F>,
    signal: CancelSignal,
) where
    S: Stream<Item = T> + Unpin,
    F: Fn(T) -> Fut,
    Fut: Future<Output = U>,
{
    let mut processed = 0u64;
    loop {
        let item = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            item = source.next() => item,
        };
        let Some(item) = item else {
            break;
        };

        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            result = (*process)(item) => result,
        };
        let sent = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            sent = output.send(result) => sent,
        };
        if sent.is_err() {
            break;
        }
        processed += 1;
    }
    trace!(branch, processed, "Fan-out branch finished");
}

/// Merge `streams` into one, reducing batches of up to `batch_size` items
///
/// The returned stream yields `merge(batch)` for every batch. Full batches
/// are emitted as soon as they fill; the trailing partial batch is emitted
/// when every source has ended, when `flush_interval` elapses, or on
/// cancellation.
///
/// # Example
///
/// ```
/// use conduit::fanout::{fan_in, FanInConfig};
/// use conduit::lifecycle::LifecycleController;
/// use futures::{stream, StreamExt};
///
/// # #[tokio::main]
/// # async fn main() -> conduit::Result<()> {
/// let root = LifecycleController::new();
/// let sources = vec![stream::iter(vec![1, 2, 3]), stream::iter(vec![4, 5])];
/// let sums: Vec<i32> = fan_in(sources, FanInConfig::new(2), &root.signal(), |batch: Vec<i32>| {
///     batch.iter().sum::<i32>()
/// })?
/// .collect()
/// .await;
/// assert_eq!(sums.iter().sum::<i32>(), 15);
/// assert_eq!(sums.len(), 3);
/// # Ok(())
/// # }
/// ```
pub fn fan_in<S, T, R, M>(
    streams: Vec<S>,
    config: FanInConfig,
    signal: &CancelSignal,
    merge: M,
) -> Result<ReceiverStream<R>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    M: Fn(Vec<T>) -> R + Send + 'static,
{
    config.validate()?;
    let (tx, rx) = mpsc::channel(config.capacity);
    let sources = streams.len();
    let merged = stream::select_all(streams.into_iter().map(Box::pin));

    signal.spawn(merge_loop(merged, tx, config, merge, signal.clone()));
    debug!(sources, "Fan-in started");
    Ok(ReceiverStream::new(rx))
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Full,
    Interval,
    Closed,
    Cancelled,
}

async fn merge_loop<S, T, R, M>(
    mut merged: S,
    output: mpsc::Sender<R>,
    config: FanInConfig,
    merge: M,
    signal: CancelSignal,
) where
    S: Stream<Item = T> + Unpin,
    M: Fn(Vec<T>) -> R,
{
    let mut batch = Vec::with_capacity(config.batch_size);
    let mut deadline: Option<Instant> = None;
    let mut batches = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                if !batch.is_empty() {
                    let result = merge(std::mem::take(&mut batch));
                    // Best effort: never wait on a consumer after cancellation
                    if output.try_send(result).is_ok() {
                        batches += 1;
                        trace_flush(FlushReason::Cancelled, batches);
                    }
                }
                break;
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                let result = merge(std::mem::take(&mut batch));
                batches += 1;
                trace_flush(FlushReason::Interval, batches);
                if !send(&output, result, &signal).await {
                    break;
                }
            }
            item = merged.next() => match item {
                Some(item) => {
                    if batch.is_empty() {
                        deadline = config.flush_interval.map(|d| Instant::now() + d);
                    }
                    batch.push(item);
                    if batch.len() >= config.batch_size {
                        deadline = None;
                        let result = merge(std::mem::replace(
                            &mut batch,
                            Vec::with_capacity(config.batch_size),
                        ));
                        batches += 1;
                        trace_flush(FlushReason::Full, batches);
                        if !send(&output, result, &signal).await {
                            break;
                        }
                    }
                }
                None => {
                    if !batch.is_empty() {
                        let result = merge(std::mem::take(&mut batch));
                        batches += 1;
                        trace_flush(FlushReason::Closed, batches);
                        send(&output, result, &signal).await;
                    }
                    break;
                }
            },
        }
    }

    debug!(batches, "Fan-in finished");
}

/// Returns `false` once the output is gone or cancellation fired
async fn send<R>(output: &mpsc::Sender<R>, result: R, signal: &CancelSignal) -> bool {
    tokio::select! {
        biased;
        _ = signal.cancelled() => {
            let _ = output.try_send(result);
            false
        }
        permit = output.reserve() => match permit {
            Ok(permit) => {
                permit.send(result);
                true
            }
            Err(_) => false,
        },
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn trace_flush(reason: FlushReason, batches: u64) {
    trace!(reason = ?reason, batches, "Fan-in flushed batch");
}
