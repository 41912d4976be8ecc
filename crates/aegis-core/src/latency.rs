//! Per-endpoint latency tracking with rolling reset.
//!
//! Each endpoint keeps a bounded ring of recent samples. The whole bucket
//! resets once it is older than the rolling window, so percentiles always
//! describe the current traffic rather than the process lifetime. The
//! overload predictor uses an endpoint's p50 as its latency baseline.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Maximum samples retained per endpoint.
pub const MAX_SAMPLES_PER_ENDPOINT: usize = 2000;

/// Default rolling reset window.
pub const DEFAULT_ROLLING_RESET: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct EndpointBucket {
    samples: Vec<f64>,
    window_started_ms: i64,
}

/// Percentile summary for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointLatency {
    /// Median latency in milliseconds.
    pub p50_ms: f64,
    /// 95th percentile latency in milliseconds.
    pub p95_ms: f64,
    /// 99th percentile latency in milliseconds.
    pub p99_ms: f64,
    /// Samples in the current window.
    pub sample_count: usize,
}

/// Thread-safe per-endpoint latency tracker.
pub struct LatencyTracker {
    rolling_reset_ms: i64,
    buckets: RwLock<HashMap<String, EndpointBucket>>,
}

impl LatencyTracker {
    /// Creates a tracker with the default 5-minute rolling reset.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rolling_reset(DEFAULT_ROLLING_RESET)
    }

    /// Creates a tracker with a custom rolling reset window.
    #[must_use]
    pub fn with_rolling_reset(window: Duration) -> Self {
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let rolling_reset_ms = window.as_millis() as i64;
        Self {
            rolling_reset_ms,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Records one observation for `endpoint` at `now_ms`.
    pub fn record(&self, endpoint: &str, elapsed_ms: f64, now_ms: i64) {
        let mut buckets = self.buckets.write().expect("latency lock poisoned");
        let bucket = buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointBucket {
                samples: Vec::new(),
                window_started_ms: now_ms,
            });
        if now_ms - bucket.window_started_ms > self.rolling_reset_ms {
            bucket.samples.clear();
            bucket.window_started_ms = now_ms;
        }
        if bucket.samples.len() == MAX_SAMPLES_PER_ENDPOINT {
            bucket.samples.remove(0);
        }
        bucket.samples.push(elapsed_ms);
    }

    /// Percentile for one endpoint; empty buckets answer 0.
    #[must_use]
    pub fn percentile(&self, endpoint: &str, q: f64) -> f64 {
        self.buckets
            .read()
            .expect("latency lock poisoned")
            .get(endpoint)
            .map_or(0.0, |bucket| percentile_of(&bucket.samples, q))
    }

    /// Summary for one endpoint, if any samples exist.
    #[must_use]
    pub fn summary(&self, endpoint: &str) -> Option<EndpointLatency> {
        let buckets = self.buckets.read().expect("latency lock poisoned");
        let bucket = buckets.get(endpoint)?;
        if bucket.samples.is_empty() {
            return None;
        }
        Some(EndpointLatency {
            p50_ms: percentile_of(&bucket.samples, 50.0),
            p95_ms: percentile_of(&bucket.samples, 95.0),
            p99_ms: percentile_of(&bucket.samples, 99.0),
            sample_count: bucket.samples.len(),
        })
    }

    /// Summaries for every endpoint with samples, used for rollback
    /// baselines and perf observations.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, EndpointLatency> {
        let buckets = self.buckets.read().expect("latency lock poisoned");
        buckets
            .iter()
            .filter(|(_, bucket)| !bucket.samples.is_empty())
            .map(|(endpoint, bucket)| {
                (
                    endpoint.clone(),
                    EndpointLatency {
                        p50_ms: percentile_of(&bucket.samples, 50.0),
                        p95_ms: percentile_of(&bucket.samples, 95.0),
                        p99_ms: percentile_of(&bucket.samples, 99.0),
                        sample_count: bucket.samples.len(),
                    },
                )
            })
            .collect()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile_of(samples: &[f64], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q = q.clamp(0.0, 100.0);
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let rank = ((q / 100.0 * sorted.len() as f64).ceil() as usize).max(1) - 1;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bucket_percentile_is_zero() {
        let tracker = LatencyTracker::new();
        assert_eq!(tracker.percentile("GET /sales", 95.0), 0.0);
        assert!(tracker.summary("GET /sales").is_none());
    }

    #[test]
    fn percentiles_over_recorded_samples() {
        let tracker = LatencyTracker::new();
        let now = 1_000_000;
        for v in 1..=100 {
            tracker.record("GET /sales", f64::from(v), now);
        }
        assert_eq!(tracker.percentile("GET /sales", 50.0), 50.0);
        assert_eq!(tracker.percentile("GET /sales", 95.0), 95.0);
        let summary = tracker.summary("GET /sales").expect("summary");
        assert_eq!(summary.sample_count, 100);
        assert_eq!(summary.p99_ms, 99.0);
    }

    #[test]
    fn rolling_reset_clears_stale_windows() {
        let tracker = LatencyTracker::new();
        let now = 1_000_000;
        tracker.record("e", 500.0, now);
        // Five minutes later the window resets before the new sample lands.
        tracker.record("e", 10.0, now + 301_000);
        let summary = tracker.summary("e").expect("summary");
        assert_eq!(summary.sample_count, 1);
        assert_eq!(summary.p95_ms, 10.0);
    }

    #[test]
    fn bounded_at_max_samples() {
        let tracker = LatencyTracker::new();
        let now = 1_000_000;
        for _ in 0..MAX_SAMPLES_PER_ENDPOINT {
            tracker.record("e", 100.0, now);
        }
        for _ in 0..10 {
            tracker.record("e", 1.0, now);
        }
        let summary = tracker.summary("e").expect("summary");
        assert_eq!(summary.sample_count, MAX_SAMPLES_PER_ENDPOINT);
    }

    #[test]
    fn snapshot_covers_all_endpoints() {
        let tracker = LatencyTracker::new();
        let now = 1_000_000;
        tracker.record("a", 10.0, now);
        tracker.record("b", 20.0, now);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["b"].p50_ms, 20.0);
    }
}
