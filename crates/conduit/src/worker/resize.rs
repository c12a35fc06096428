//! Dynamic pool sizing
//!
//! [`ResizablePool`] decorates a running [`WorkerPool`]: it adds worker loops
//! or cancels individual ones, never touching the core execution path.
//! [`LoadMonitor`] drives it from the pool's backpressure watermarks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::pool::{WorkerPool, WorkerPoolStatus};
use crate::config::duration_millis;
use crate::error::{Result, RuntimeError};
use crate::lifecycle::CancelSignal;

/// Worker pool that can grow and shrink between bounds
pub struct ResizablePool {
    pool: Arc<WorkerPool>,
    min_workers: usize,
    max_workers: usize,
    resize: Mutex<()>,
}

impl ResizablePool {
    /// Wrap `pool`, keeping its worker count within `min..=max`
    pub fn new(pool: Arc<WorkerPool>, min_workers: usize, max_workers: usize) -> Result<Self> {
        if min_workers == 0 || min_workers > max_workers {
            return Err(RuntimeError::InvalidConfig(format!(
                "invalid worker bounds {min_workers}..={max_workers}"
            )));
        }
        Ok(Self {
            pool,
            min_workers,
            max_workers,
            resize: Mutex::new(()),
        })
    }

    /// The wrapped pool
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Live worker loops
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Lower bound
    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    /// Upper bound
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Spawn up to `n` workers, stopping at the upper bound
    ///
    /// Returns how many were added.
    pub fn add_workers(&self, n: usize) -> Result<usize> {
        let _guard = self.resize.lock();
        self.ensure_running()?;

        let room = self.max_workers.saturating_sub(self.pool.worker_count());
        let added = n.min(room);
        for _ in 0..added {
            self.pool.spawn_worker();
        }
        if added > 0 {
            info!(
                pool = %self.pool.name(),
                added,
                workers = self.pool.worker_count(),
                "Added workers"
            );
        }
        Ok(added)
    }

    /// Retire up to `n` workers, stopping at the lower bound
    ///
    /// Retired workers finish their current task before exiting. Returns
    /// how many were retired.
    pub fn remove_workers(&self, n: usize) -> Result<usize> {
        let _guard = self.resize.lock();
        self.ensure_running()?;

        let surplus = self.pool.worker_count().saturating_sub(self.min_workers);
        let mut removed = 0;
        for _ in 0..n.min(surplus) {
            if self.pool.retire_worker().is_none() {
                break;
            }
            removed += 1;
        }
        if removed > 0 {
            info!(
                pool = %self.pool.name(),
                removed,
                workers = self.pool.worker_count(),
                "Removed workers"
            );
        }
        Ok(removed)
    }

    /// Grow or shrink towards `target`, clamped to the bounds
    pub fn resize_to(&self, target: usize) -> Result<usize> {
        let current = self.worker_count();
        if target > current {
            self.add_workers(target - current)?;
        } else if target < current {
            self.remove_workers(current - target)?;
        }
        Ok(self.worker_count())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.pool.status() != WorkerPoolStatus::Running {
            return Err(RuntimeError::NotRunning);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResizablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResizablePool")
            .field("pool", &self.pool)
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

/// Load monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadMonitorConfig {
    /// Time between samples
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Workers added or removed per decision
    pub step: usize,
}

impl Default for LoadMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            step: 1,
        }
    }
}

impl LoadMonitorConfig {
    /// Set the sampling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the resize step
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step.max(1);
        self
    }
}

/// Outcome of one load sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Saturated with work waiting
    Grow,
    /// Mostly idle with nothing queued
    Shrink,
    /// Leave the pool as it is
    Hold,
}

/// Periodically resizes a [`ResizablePool`]
///
/// Grows when busy workers are at or above the high watermark and tasks are
/// queued; shrinks when at or below the low watermark and the queue is empty.
pub struct LoadMonitor {
    pool: Arc<ResizablePool>,
    config: LoadMonitorConfig,
}

impl LoadMonitor {
    /// Create a monitor for `pool`
    pub fn new(pool: Arc<ResizablePool>, config: LoadMonitorConfig) -> Self {
        Self { pool, config }
    }

    /// Sample the pool without acting
    pub fn evaluate(&self) -> ScaleDecision {
        let inner = self.pool.pool();
        let watermarks = inner.backpressure().config();
        let ratio = inner.backpressure().load_ratio();
        let queued = inner.queue_depth();
        let workers = self.pool.worker_count();

        if ratio >= watermarks.high_watermark && queued > 0 && workers < self.pool.max_workers() {
            ScaleDecision::Grow
        } else if ratio <= watermarks.low_watermark
            && queued == 0
            && workers > self.pool.min_workers()
        {
            ScaleDecision::Shrink
        } else {
            ScaleDecision::Hold
        }
    }

    /// Sample once and apply the decision
    pub fn step(&self) -> Result<ScaleDecision> {
        let decision = self.evaluate();
        match decision {
            ScaleDecision::Grow => {
                self.pool.add_workers(self.config.step)?;
            }
            ScaleDecision::Shrink => {
                self.pool.remove_workers(self.config.step)?;
            }
            ScaleDecision::Hold => {}
        }
        Ok(decision)
    }

    /// Sample every `interval` until `signal` fires or the pool stops
    pub async fn run(self, signal: CancelSignal) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    debug!("Load monitor: shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.step() {
                        debug!(error = %e, "Load monitor: pool no longer running");
                        break;
                    }
                }
            }
        }

        debug!("Load monitor exited");
    }

    /// Run in the background as in-flight work of `signal`'s owner
    pub fn spawn(self, signal: CancelSignal) -> JoinHandle<()> {
        let tracked = signal.clone();
        tracked.spawn(self.run(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::worker::{Task, WorkerPoolConfig};
    use tokio::sync::Semaphore;

    fn running_pool(workers: usize) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(workers)
                .with_queue_capacity(16)
                .with_shutdown_timeout(Duration::from_secs(5)),
        ));
        pool.start().unwrap();
        pool
    }

    #[test]
    fn test_invalid_bounds() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new(1)));
        assert!(ResizablePool::new(Arc::clone(&pool), 0, 4).is_err());
        assert!(ResizablePool::new(Arc::clone(&pool), 5, 4).is_err());
        assert!(ResizablePool::new(pool, 1, 4).is_ok());
    }

    #[tokio::test]
    async fn test_add_and_remove_respect_bounds() {
        let pool = running_pool(2);
        let resizable = ResizablePool::new(Arc::clone(&pool), 1, 4).unwrap();

        assert_eq!(resizable.add_workers(5).unwrap(), 2);
        assert_eq!(resizable.worker_count(), 4);

        assert_eq!(resizable.remove_workers(10).unwrap(), 3);
        assert_eq!(resizable.worker_count(), 1);

        assert_eq!(resizable.resize_to(3).unwrap(), 3);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_requires_running_pool() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new(1)));
        let resizable = ResizablePool::new(pool, 1, 4).unwrap();
        assert!(matches!(
            resizable.add_workers(1),
            Err(RuntimeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_retired_worker_finishes_current_task() {
        let pool = running_pool(2);
        let resizable = ResizablePool::new(Arc::clone(&pool), 1, 2).unwrap();
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for i in 0..2u32 {
            let gate = Arc::clone(&gate);
            handles.push(
                pool.submit(Task::new(i, move |n: u32, _ctx| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await;
                        Ok::<_, TaskError>(n)
                    }
                }))
                .await
                .unwrap(),
            );
        }
        while pool.current_load() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(resizable.remove_workers(1).unwrap(), 1);
        gate.add_permits(2);

        for handle in handles {
            assert!(handle.wait().await.is_ok());
        }
        assert_eq!(pool.stats().processed, 2);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_grows_under_load_and_shrinks_when_idle() {
        let pool = running_pool(1);
        let resizable = Arc::new(ResizablePool::new(Arc::clone(&pool), 1, 3).unwrap());
        let monitor = LoadMonitor::new(Arc::clone(&resizable), LoadMonitorConfig::default());
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            handles.push(
                pool.submit(Task::new((), move |_, _ctx| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await;
                        Ok::<_, TaskError>(())
                    }
                }))
                .await
                .unwrap(),
            );
        }
        while pool.current_load() < 1 {
            tokio::task::yield_now().await;
        }

        assert_eq!(monitor.step().unwrap(), ScaleDecision::Grow);
        assert_eq!(resizable.worker_count(), 2);

        gate.add_permits(4);
        for handle in handles {
            handle.wait().await.unwrap();
        }
        while pool.current_load() > 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(monitor.step().unwrap(), ScaleDecision::Shrink);
        assert_eq!(resizable.worker_count(), 1);
        assert_eq!(monitor.evaluate(), ScaleDecision::Hold);
        pool.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_exits_on_cancel() {
        let pool = running_pool(1);
        let resizable = Arc::new(ResizablePool::new(Arc::clone(&pool), 1, 2).unwrap());
        let monitor = LoadMonitor::new(
            resizable,
            LoadMonitorConfig::default().with_interval(Duration::from_millis(10)),
        );

        let handle = monitor.spawn(pool.signal());
        pool.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
