//! Latency metrics
//!
//! Percentiles come from a bounded window of the most recent samples so a
//! long-running pool keeps constant memory; count, mean, min and max cover
//! every sample ever recorded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Samples kept for percentile calculation
pub const DEFAULT_SAMPLE_WINDOW: usize = 4096;

/// Histogram for latency measurements
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Most recent samples (for percentile calculation)
    samples: Mutex<VecDeque<Duration>>,
    /// Maximum retained samples
    window: usize,
    /// Sum of all samples (for mean calculation)
    sum_micros: AtomicU64,
    /// Count of samples
    count: AtomicU64,
    /// Min latency observed
    min_micros: AtomicU64,
    /// Max latency observed
    max_micros: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_SAMPLE_WINDOW)
    }

    /// Histogram retaining at most `window` samples for percentiles
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(window.min(DEFAULT_SAMPLE_WINDOW))),
            window,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }

    /// Record a latency sample
    pub fn record(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        {
            let mut samples = self.samples.lock();
            if samples.len() == self.window {
                samples.pop_front();
            }
            samples.push_back(duration);
        }
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        self.min_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    /// Get the count of samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the mean latency
    pub fn mean(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let sum = self.sum_micros.load(Ordering::Relaxed);
        Duration::from_micros(sum / count)
    }

    /// Get the minimum latency
    pub fn min(&self) -> Duration {
        let min = self.min_micros.load(Ordering::Relaxed);
        if min == u64::MAX {
            Duration::ZERO
        } else {
            Duration::from_micros(min)
        }
    }

    /// Get the maximum latency
    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_micros.load(Ordering::Relaxed))
    }

    /// Calculate percentile (0.0 to 1.0) over the retained window
    pub fn percentile(&self, p: f64) -> Duration {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        percentile_of(&mut sorted, p)
    }

    /// Get summary statistics
    pub fn summary(&self) -> LatencySummary {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        sorted.sort_unstable();
        LatencySummary {
            count: self.count(),
            mean: self.mean(),
            min: self.min(),
            max: self.max(),
            p50: percentile_of(&mut sorted, 0.50),
            p95: percentile_of(&mut sorted, 0.95),
            p99: percentile_of(&mut sorted, 0.99),
        }
    }
}

fn percentile_of(samples: &mut [Duration], p: f64) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    samples.sort_unstable();
    let idx = ((samples.len() as f64 * p.clamp(0.0, 1.0)) as usize).min(samples.len() - 1);
    samples[idx]
}

/// Summary statistics for latency
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram() {
        let histogram = LatencyHistogram::new();
        let summary = histogram.summary();
        assert_eq!(summary, LatencySummary::default());
    }

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();

        for i in 1..=100 {
            histogram.record(Duration::from_millis(i));
        }

        assert_eq!(histogram.count(), 100);
        assert_eq!(histogram.min(), Duration::from_millis(1));
        assert_eq!(histogram.max(), Duration::from_millis(100));

        let p50 = histogram.percentile(0.5);
        assert!(p50 >= Duration::from_millis(49) && p50 <= Duration::from_millis(51));
    }

    #[test]
    fn test_window_bounds_percentiles_only() {
        let histogram = LatencyHistogram::with_window(10);
        for i in 1..=100 {
            histogram.record(Duration::from_millis(i));
        }

        let summary = histogram.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, Duration::from_millis(1));
        // Only samples 91..=100 remain for percentiles
        assert!(summary.p50 >= Duration::from_millis(91));
    }
}
