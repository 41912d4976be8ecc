//! In-process metrics registry with declarative thresholds.
//!
//! The registry exposes three metric families:
//!
//! - **Gauges**: last-write-wins floating point values
//! - **Counters**: monotonically increasing integers
//! - **Histograms**: bounded rings of the most recent samples, answering
//!   percentile queries by sorting the live window
//!
//! Histograms deliberately keep raw samples instead of cumulative buckets:
//! the overload predictor and the rollback watcher both need exact
//! percentiles over the recent window, which bucketed encodings cannot
//! answer.
//!
//! # Thresholds
//!
//! Gauge writes are evaluated against declared [`MetricThreshold`]s. A breach
//! notifies every registered observer, rate-limited per metric by the
//! threshold's cooldown. Observers are plain callbacks registered with
//! [`MetricsRegistry::on_threshold_breach`]; the daemon binds them to the
//! alert transport at bootstrap.
//!
//! # Exposition
//!
//! [`MetricsRegistry::encode_text`] renders a Prometheus-style text dump
//! (gauge/counter/summary families, summary quantiles 0.5/0.95/0.99) and
//! [`MetricsRegistry::snapshot_json`] renders a JSON snapshot for the
//! `/metrics/json` endpoint.
//!
//! # Thread Safety
//!
//! All operations take `&self` and serialize access through internal locks.
//! The registry is shared as `Arc<MetricsRegistry>` across handlers and
//! background jobs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Maximum number of samples retained per histogram. Older samples drop
/// silently once the ring is full.
pub const MAX_HISTOGRAM_SAMPLES: usize = 2000;

/// Quantiles rendered in the text exposition for each histogram.
const SUMMARY_QUANTILES: [f64; 3] = [50.0, 95.0, 99.0];

// =============================================================================
// Thresholds
// =============================================================================

/// Comparison operator for a threshold rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    /// Breach when the gauge is strictly greater than the limit.
    GreaterThan,
    /// Breach when the gauge is strictly less than the limit.
    LessThan,
    /// Breach when the gauge is greater than or equal to the limit.
    GreaterOrEqual,
    /// Breach when the gauge is less than or equal to the limit.
    LessOrEqual,
}

impl ThresholdOp {
    /// Applies the operator to `actual` against `limit`.
    #[must_use]
    pub fn matches(self, actual: f64, limit: f64) -> bool {
        match self {
            Self::GreaterThan => actual > limit,
            Self::LessThan => actual < limit,
            Self::GreaterOrEqual => actual >= limit,
            Self::LessOrEqual => actual <= limit,
        }
    }
}

impl fmt::Display for ThresholdOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::LessThan => write!(f, "<"),
            Self::GreaterOrEqual => write!(f, ">="),
            Self::LessOrEqual => write!(f, "<="),
        }
    }
}

/// Severity attached to threshold breaches and downstream alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational; no operator action expected.
    Low,
    /// Worth a look during business hours.
    Medium,
    /// Degradation that needs attention soon.
    High,
    /// Immediate operator attention required.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A declarative rule evaluated on every write of the named gauge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThreshold {
    /// Gauge name this rule watches.
    pub metric: String,
    /// Comparison operator.
    pub op: ThresholdOp,
    /// Limit the gauge is compared against.
    pub value: f64,
    /// Severity of the emitted breach.
    pub severity: Severity,
    /// Minimum interval between breach emissions for this metric.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl MetricThreshold {
    /// Creates a threshold rule.
    #[must_use]
    pub fn new(
        metric: impl Into<String>,
        op: ThresholdOp,
        value: f64,
        severity: Severity,
        cooldown: Duration,
    ) -> Self {
        Self {
            metric: metric.into(),
            op,
            value,
            severity,
            cooldown,
        }
    }
}

/// Breach event delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdBreach {
    /// Gauge that breached.
    pub metric: String,
    /// Operator of the breached rule.
    pub op: ThresholdOp,
    /// Configured limit.
    pub threshold: f64,
    /// Observed gauge value.
    pub actual: f64,
    /// Severity of the rule.
    pub severity: Severity,
}

type BreachObserver = Box<dyn Fn(&ThresholdBreach) + Send + Sync>;

// =============================================================================
// Sample ring
// =============================================================================

#[derive(Debug, Default)]
struct SampleRing {
    samples: VecDeque<f64>,
}

impl SampleRing {
    fn record(&mut self, value: f64) {
        if self.samples.len() == MAX_HISTOGRAM_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile over the live window. Empty rings answer 0.
    fn percentile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let q = q.clamp(0.0, 100.0);
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let rank = ((q / 100.0 * sorted.len() as f64).ceil() as usize).max(1) - 1;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe metrics registry with threshold evaluation on gauge writes.
pub struct MetricsRegistry {
    gauges: RwLock<HashMap<String, f64>>,
    counters: RwLock<HashMap<String, u64>>,
    histograms: RwLock<HashMap<String, SampleRing>>,
    thresholds: RwLock<Vec<MetricThreshold>>,
    /// Last breach emission per metric, for cooldown enforcement.
    last_breach: Mutex<HashMap<String, Instant>>,
    observers: RwLock<Vec<BreachObserver>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates an empty registry with no thresholds declared.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gauges: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            thresholds: RwLock::new(Vec::new()),
            last_breach: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry with the given threshold rules declared.
    #[must_use]
    pub fn with_thresholds(thresholds: Vec<MetricThreshold>) -> Self {
        let registry = Self::new();
        *registry
            .thresholds
            .write()
            .expect("thresholds lock poisoned") = thresholds;
        registry
    }

    // -------------------------------------------------------------------------
    // Gauges
    // -------------------------------------------------------------------------

    /// Writes a gauge and evaluates every threshold declared for it.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .write()
            .expect("gauges lock poisoned")
            .insert(name.to_string(), value);
        self.evaluate_thresholds(name, value);
    }

    /// Reads a gauge; absent gauges answer 0.
    #[must_use]
    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges
            .read()
            .expect("gauges lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    /// Increments a counter by 1 and returns the new value.
    pub fn increment(&self, name: &str) -> u64 {
        self.increment_by(name, 1)
    }

    /// Increments a counter by `by` and returns the new value.
    pub fn increment_by(&self, name: &str, by: u64) -> u64 {
        let mut counters = self.counters.write().expect("counters lock poisoned");
        let entry = counters.entry(name.to_string()).or_insert(0);
        *entry = entry.saturating_add(by);
        *entry
    }

    /// Reads a counter; absent counters answer 0.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .expect("counters lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Histograms
    // -------------------------------------------------------------------------

    /// Records a histogram sample. The ring keeps the most recent
    /// [`MAX_HISTOGRAM_SAMPLES`] samples.
    pub fn record(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .expect("histograms lock poisoned")
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    /// Percentile query (`q` in `[0, 100]`) over the live sample window.
    /// Unknown histograms and empty windows answer 0.
    #[must_use]
    pub fn percentile(&self, name: &str, q: f64) -> f64 {
        self.histograms
            .read()
            .expect("histograms lock poisoned")
            .get(name)
            .map_or(0.0, |ring| ring.percentile(q))
    }

    // -------------------------------------------------------------------------
    // Thresholds & observers
    // -------------------------------------------------------------------------

    /// Declares an additional threshold rule.
    pub fn declare_threshold(&self, threshold: MetricThreshold) {
        self.thresholds
            .write()
            .expect("thresholds lock poisoned")
            .push(threshold);
    }

    /// Registers an observer invoked on every (cooldown-respecting) breach.
    pub fn on_threshold_breach<F>(&self, handler: F)
    where
        F: Fn(&ThresholdBreach) + Send + Sync + 'static,
    {
        self.observers
            .write()
            .expect("observers lock poisoned")
            .push(Box::new(handler));
    }

    fn evaluate_thresholds(&self, name: &str, actual: f64) {
        let breaches: Vec<ThresholdBreach> = {
            let thresholds = self.thresholds.read().expect("thresholds lock poisoned");
            thresholds
                .iter()
                .filter(|t| t.metric == name && t.op.matches(actual, t.value))
                .map(|t| ThresholdBreach {
                    metric: t.metric.clone(),
                    op: t.op,
                    threshold: t.value,
                    actual,
                    severity: t.severity,
                })
                .collect()
        };
        if breaches.is_empty() {
            return;
        }

        // One emission per metric per cooldown window, regardless of how many
        // rules matched. The most severe matching rule wins.
        let breach = breaches
            .into_iter()
            .max_by_key(|b| b.severity)
            .expect("non-empty breach list");
        let cooldown = {
            let thresholds = self.thresholds.read().expect("thresholds lock poisoned");
            thresholds
                .iter()
                .filter(|t| t.metric == name)
                .map(|t| t.cooldown)
                .min()
                .unwrap_or(Duration::ZERO)
        };
        {
            let mut last = self.last_breach.lock().expect("last_breach lock poisoned");
            if let Some(previous) = last.get(name) {
                if previous.elapsed() < cooldown {
                    return;
                }
            }
            last.insert(name.to_string(), Instant::now());
        }

        let observers = self.observers.read().expect("observers lock poisoned");
        for observer in observers.iter() {
            observer(&breach);
        }
    }

    // -------------------------------------------------------------------------
    // Exposition
    // -------------------------------------------------------------------------

    /// Renders a Prometheus-style text exposition: gauges, counters (with a
    /// `_total` suffix), and histograms as summaries with quantiles
    /// 0.5/0.95/0.99 plus `_sum` and `_count`.
    #[must_use]
    pub fn encode_text(&self) -> String {
        let mut out = String::new();

        let gauges = self.gauges.read().expect("gauges lock poisoned");
        let mut gauge_names: Vec<&String> = gauges.keys().collect();
        gauge_names.sort();
        for name in gauge_names {
            let sanitized = sanitize_metric_name(name);
            out.push_str(&format!("# TYPE {sanitized} gauge\n"));
            out.push_str(&format!("{sanitized} {}\n", gauges[name]));
        }
        drop(gauges);

        let counters = self.counters.read().expect("counters lock poisoned");
        let mut counter_names: Vec<&String> = counters.keys().collect();
        counter_names.sort();
        for name in counter_names {
            let sanitized = format!("{}_total", sanitize_metric_name(name));
            out.push_str(&format!("# TYPE {sanitized} counter\n"));
            out.push_str(&format!("{sanitized} {}\n", counters[name]));
        }
        drop(counters);

        let histograms = self.histograms.read().expect("histograms lock poisoned");
        let mut histogram_names: Vec<&String> = histograms.keys().collect();
        histogram_names.sort();
        for name in histogram_names {
            let ring = &histograms[name];
            let sanitized = sanitize_metric_name(name);
            out.push_str(&format!("# TYPE {sanitized} summary\n"));
            for q in SUMMARY_QUANTILES {
                out.push_str(&format!(
                    "{sanitized}{{quantile=\"{}\"}} {}\n",
                    q / 100.0,
                    ring.percentile(q)
                ));
            }
            out.push_str(&format!("{sanitized}_sum {}\n", ring.sum()));
            out.push_str(&format!("{sanitized}_count {}\n", ring.len()));
        }

        out
    }

    /// Renders a JSON snapshot of every gauge, counter (`_total`-suffixed),
    /// and histogram (p50/p95/p99).
    #[must_use]
    pub fn snapshot_json(&self) -> serde_json::Value {
        let gauges = self.gauges.read().expect("gauges lock poisoned");
        let gauge_map: serde_json::Map<String, serde_json::Value> = gauges
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect();
        drop(gauges);

        let counters = self.counters.read().expect("counters lock poisoned");
        let counter_map: serde_json::Map<String, serde_json::Value> = counters
            .iter()
            .map(|(name, value)| (format!("{name}_total"), json!(value)))
            .collect();
        drop(counters);

        let histograms = self.histograms.read().expect("histograms lock poisoned");
        let histogram_map: serde_json::Map<String, serde_json::Value> = histograms
            .iter()
            .map(|(name, ring)| {
                (
                    name.clone(),
                    json!({
                        "p50": ring.percentile(50.0),
                        "p95": ring.percentile(95.0),
                        "p99": ring.percentile(99.0),
                        "count": ring.len(),
                    }),
                )
            })
            .collect();

        json!({
            "gauges": gauge_map,
            "counters": counter_map,
            "histograms": histogram_map,
        })
    }
}

/// Replaces characters outside `[a-zA-Z0-9_:]` with underscores so dotted
/// registry names stay valid in the text exposition.
fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
