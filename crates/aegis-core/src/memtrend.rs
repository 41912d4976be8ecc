//! Heap-growth trend estimation.
//!
//! The perf engine samples resident heap megabytes once a minute and keeps
//! the most recent samples in a bounded ring. The trend is the least-squares
//! slope over `(timestamp, mb)` expressed in MB per minute; sustained growth
//! above the threshold flags a likely leak.

use std::collections::VecDeque;
use std::sync::RwLock;

/// Samples retained in the ring (one hour at the default cadence).
pub const MAX_MEMORY_SAMPLES: usize = 60;

/// Slope above which the trend is reported as growing, in MB/min.
pub const GROWTH_THRESHOLD_MB_PER_MIN: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
struct MemorySample {
    at_ms: i64,
    heap_mb: f64,
}

/// Trend summary over the current ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryTrend {
    /// Least-squares slope in MB per minute.
    pub slope_mb_per_min: f64,
    /// Whether the slope exceeds [`GROWTH_THRESHOLD_MB_PER_MIN`].
    pub growing: bool,
    /// Samples contributing to the estimate.
    pub sample_count: usize,
    /// Most recent heap reading in MB.
    pub latest_mb: f64,
}

/// Bounded ring of heap samples with trend estimation.
pub struct MemoryTrendTracker {
    samples: RwLock<VecDeque<MemorySample>>,
}

impl MemoryTrendTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(VecDeque::new()),
        }
    }

    /// Appends one heap sample.
    pub fn sample(&self, heap_mb: f64, now_ms: i64) {
        let mut samples = self.samples.write().expect("memtrend lock poisoned");
        if samples.len() == MAX_MEMORY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(MemorySample {
            at_ms: now_ms,
            heap_mb,
        });
    }

    /// Computes the current trend. Fewer than two samples yield a flat
    /// trend.
    #[must_use]
    pub fn trend(&self) -> MemoryTrend {
        let samples = self.samples.read().expect("memtrend lock poisoned");
        let n = samples.len();
        let latest_mb = samples.back().map_or(0.0, |s| s.heap_mb);
        if n < 2 {
            return MemoryTrend {
                slope_mb_per_min: 0.0,
                growing: false,
                sample_count: n,
                latest_mb,
            };
        }

        // Least squares over (minutes since first sample, mb).
        let t0 = samples.front().map_or(0, |s| s.at_ms);
        #[allow(clippy::cast_precision_loss)]
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| ((s.at_ms - t0) as f64 / 60_000.0, s.heap_mb))
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let count = n as f64;
        let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / count;
        let mean_mb = points.iter().map(|(_, mb)| mb).sum::<f64>() / count;
        let numerator: f64 = points
            .iter()
            .map(|(t, mb)| (t - mean_t) * (mb - mean_mb))
            .sum();
        let denominator: f64 = points.iter().map(|(t, _)| (t - mean_t).powi(2)).sum();
        let slope = if denominator.abs() < f64::EPSILON {
            0.0
        } else {
            numerator / denominator
        };

        MemoryTrend {
            slope_mb_per_min: slope,
            growing: slope > GROWTH_THRESHOLD_MB_PER_MIN,
            sample_count: n,
            latest_mb,
        }
    }
}

impl Default for MemoryTrendTracker {
    fn default() -> Self {
        Self::new()
    }
}
