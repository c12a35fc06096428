//! Pool counters
//!
//! Counters only move forward and are touched through atomic increments;
//! nothing outside this module can write them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::{LatencyHistogram, LatencySummary};

/// Point-in-time view of pool counters
///
/// `processed + failed <= submitted` always holds; the two are equal once
/// the pool is drained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Tasks accepted into the queue
    pub submitted: u64,
    /// Tasks that completed successfully
    pub processed: u64,
    /// Tasks that ended in failure, including cancelled ones
    pub failed: u64,
    /// Retry attempts scheduled
    pub retried: u64,
    /// Failed tasks that were cancelled before completing
    pub cancelled: u64,
    /// Attempts that exceeded their timeout
    pub timed_out_attempts: u64,
    /// Handlers running right now
    pub in_flight: u64,
    /// Latency of successful executions, first attempt to success
    pub latency: LatencySummary,
}

impl PoolStats {
    /// Tasks that reached a terminal state
    pub fn completed(&self) -> u64 {
        self.processed + self.failed
    }

    /// Tasks accepted but not yet terminal
    pub fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.completed())
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    submitted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    timed_out_attempts: AtomicU64,
    in_flight: AtomicU64,
    latency: LatencyHistogram,
}

impl StatsRecorder {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn processed(&self, latency: Duration) {
        self.latency.record(latency);
        self.processed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self) {
        self.timed_out_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Terminal counters are read before `submitted` so a concurrent
    /// completion can never make the snapshot show more done than accepted.
    pub(crate) fn snapshot(&self) -> PoolStats {
        let processed = self.processed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let cancelled = self.cancelled.load(Ordering::Acquire);
        let submitted = self.submitted.load(Ordering::Acquire);

        PoolStats {
            submitted,
            processed,
            failed,
            retried: self.retried.load(Ordering::Relaxed),
            cancelled,
            timed_out_attempts: self.timed_out_attempts.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            latency: self.latency.summary(),
        }
    }
}
