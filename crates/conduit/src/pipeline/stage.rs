//! Stage definition and worker loop

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::StageFailure;
use crate::error::TaskError;
use crate::lifecycle::CancelSignal;

pub(crate) type Transform<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, std::result::Result<T, TaskError>> + Send + Sync>;

pub(crate) type SharedInput<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

/// Counters for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage name
    pub stage: String,
    /// Items transformed successfully
    pub processed: u64,
    /// Items whose transform failed
    pub failed: u64,
}

pub(crate) struct Stage<T> {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) workers: usize,
    pub(crate) buffer: usize,
    pub(crate) transform: Transform<T>,
    processed: AtomicU64,
    failed: AtomicU64,
    live_workers: AtomicUsize,
}

impl<T> Stage<T> {
    pub(crate) fn new(
        name: String,
        index: usize,
        workers: usize,
        buffer: usize,
        transform: Transform<T>,
    ) -> Self {
        Self {
            name,
            index,
            workers,
            buffer,
            transform,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            live_workers: AtomicUsize::new(workers),
        }
    }

    pub(crate) fn stats(&self) -> StageStats {
        StageStats {
            stage: self.name.clone(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Lossy sender for the error side channel
#[derive(Clone)]
pub(crate) struct ErrorSink {
    tx: mpsc::Sender<StageFailure>,
    dropped: Arc<AtomicU64>,
}

impl ErrorSink {
    pub(crate) fn new(tx: mpsc::Sender<StageFailure>, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, dropped }
    }

    /// Never blocks the success path
    fn report(&self, failure: StageFailure) {
        if let Err(e) = self.tx.try_send(failure) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let failure = match e {
                mpsc::error::TrySendError::Full(f) | mpsc::error::TrySendError::Closed(f) => f,
            };
            debug!(
                stage = %failure.stage,
                error = %failure.error,
                "Error channel unavailable, dropping failure"
            );
        }
    }
}

/// One worker of a stage
///
/// Exits when its input is exhausted, when the downstream buffer is gone, or
/// on cancellation. Dropping `output` on exit is what eventually closes the
/// stage's buffer.
pub(crate) async fn stage_worker<T: Send + 'static>(
    stage: Arc<Stage<T>>,
    worker: usize,
    input: SharedInput<T>,
    output: mpsc::Sender<T>,
    errors: ErrorSink,
    signal: CancelSignal,
) {
    trace!(stage = %stage.name, worker, "Stage worker started");

    loop {
        let item = {
            let mut receiver = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                receiver = input.lock() => receiver,
            };
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                item = receiver.recv() => item,
            }
        };
        let Some(item) = item else {
            break;
        };

        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            result = (stage.transform)(item) => result,
        };

        match result {
            Ok(item) => {
                stage.processed.fetch_add(1, Ordering::Relaxed);
                let sent = tokio::select! {
                    biased;
                    _ = signal.cancelled() => break,
                    sent = output.send(item) => sent,
                };
                if sent.is_err() {
                    debug!(stage = %stage.name, worker, "Downstream closed");
                    break;
                }
            }
            Err(error) => {
                stage.failed.fetch_add(1, Ordering::Relaxed);
                errors.report(StageFailure {
                    stage: stage.name.clone(),
                    index: stage.index,
                    error,
                });
            }
        }
    }

    if stage.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        info!(
            stage = %stage.name,
            processed = stage.processed.load(Ordering::Relaxed),
            failed = stage.failed.load(Ordering::Relaxed),
            "Stage drained, closing output"
        );
    }
}
