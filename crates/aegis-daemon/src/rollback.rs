//! Post-deploy auto-rollback watcher.
//!
//! Started right after a successful deploy with a caller-supplied rollback
//! action. On start it captures a baseline (current error rate plus each
//! endpoint's p95), then re-reads the live values on every poll. A spike —
//! error rate above the absolute threshold and twice the baseline, or an
//! endpoint p95 above twice its baseline and the absolute floor — opens a
//! watch window; if the spike holds continuously to the window's end the
//! watcher fires one CRITICAL alert, opens a P1 incident, stops itself,
//! and invokes the rollback. A spike that clears resets the window.
//!
//! A zero baseline would make the "twice the baseline" test vacuous, so
//! the comparison always adds a small epsilon to the baseline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aegis_core::incident::IncidentPriority;
use aegis_core::latency::LatencyTracker;
use aegis_core::metrics::{MetricsRegistry, Severity};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::incidents::{IncidentManager, IncidentSpec};

/// Watcher tunables.
#[derive(Debug, Clone)]
pub struct RollbackConfig {
    /// How often live values are re-read.
    pub poll_interval: Duration,
    /// How long a spike must persist before rollback fires.
    pub spike_window: Duration,
    /// Absolute error-rate threshold, percent.
    pub error_rate_threshold_pct: f64,
    /// Absolute p95 floor, milliseconds.
    pub latency_floor_ms: f64,
    /// Epsilon added to baselines so a zero baseline cannot make the
    /// doubling test vacuous.
    pub baseline_epsilon: f64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            spike_window: Duration::from_secs(60),
            error_rate_threshold_pct: 3.0,
            latency_floor_ms: 500.0,
            baseline_epsilon: 0.1,
        }
    }
}

/// Baseline captured when the watcher starts.
#[derive(Debug, Clone)]
struct Baseline {
    error_rate_pct: f64,
    p95_by_endpoint: HashMap<String, f64>,
}

/// Rollback action invoked when a sustained spike is confirmed.
pub type RollbackFn = Box<dyn FnOnce() + Send>;

/// Handle to a running watcher.
pub struct RollbackHandle {
    stop: watch::Sender<bool>,
    triggered: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl RollbackHandle {
    /// Stops the watcher without rolling back (deploy declared good).
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Whether the watcher fired the rollback.
    #[must_use]
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Waits for the watcher task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// The auto-rollback watcher.
pub struct RollbackWatcher {
    registry: Arc<MetricsRegistry>,
    latency: Arc<LatencyTracker>,
    alerts: AlertDispatcher,
    incidents: Arc<IncidentManager>,
    clock: SharedClock,
    config: RollbackConfig,
}

impl RollbackWatcher {
    /// Creates a watcher (not yet running).
    #[must_use]
    pub fn new(
        registry: Arc<MetricsRegistry>,
        latency: Arc<LatencyTracker>,
        alerts: AlertDispatcher,
        incidents: Arc<IncidentManager>,
        clock: SharedClock,
        config: RollbackConfig,
    ) -> Self {
        Self {
            registry,
            latency,
            alerts,
            incidents,
            clock,
            config,
        }
    }

    /// Captures the baseline and spawns the poll loop.
    #[must_use]
    pub fn start(self, rollback: RollbackFn) -> RollbackHandle {
        let baseline = self.capture_baseline();
        info!(
            baseline_error_rate = baseline.error_rate_pct,
            endpoints = baseline.p95_by_endpoint.len(),
            "auto-rollback watcher started"
        );
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let triggered = Arc::new(AtomicBool::new(false));
        let triggered_flag = Arc::clone(&triggered);
        let rollback = Mutex::new(Some(rollback));

        let task = tokio::spawn(async move {
            let mut spike_started_ms: Option<i64> = None;
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the deploy has
            // one full interval to settle.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        info!("auto-rollback watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let now = self.clock.now_ms();
                match self.detect_spike(&baseline) {
                    Some(detail) => {
                        let started = *spike_started_ms.get_or_insert(now);
                        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
                        let window_ms = self.config.spike_window.as_millis() as i64;
                        warn!(detail, since_ms = now - started, "post-deploy spike");
                        if now - started >= window_ms {
                            self.trigger(&detail);
                            triggered_flag.store(true, Ordering::SeqCst);
                            if let Some(rollback) =
                                rollback.lock().expect("rollback lock poisoned").take()
                            {
                                rollback();
                            }
                            return;
                        }
                    },
                    None => {
                        if spike_started_ms.take().is_some() {
                            info!("post-deploy spike cleared; window reset");
                        }
                    },
                }
            }
        });

        RollbackHandle {
            stop: stop_tx,
            triggered,
            task,
        }
    }

    fn capture_baseline(&self) -> Baseline {
        Baseline {
            error_rate_pct: self.registry.gauge("http.error_rate"),
            p95_by_endpoint: self
                .latency
                .snapshot()
                .into_iter()
                .map(|(endpoint, summary)| (endpoint, summary.p95_ms))
                .collect(),
        }
    }

    /// Returns a spike description when current values regress past the
    /// baseline, or `None` when the system looks healthy.
    fn detect_spike(&self, baseline: &Baseline) -> Option<String> {
        let error_rate = self.registry.gauge("http.error_rate");
        if error_rate > self.config.error_rate_threshold_pct
            && error_rate > 2.0 * (baseline.error_rate_pct + self.config.baseline_epsilon)
        {
            return Some(format!(
                "error rate {error_rate:.2}% vs baseline {:.2}%",
                baseline.error_rate_pct
            ));
        }

        for (endpoint, summary) in self.latency.snapshot() {
            let baseline_p95 = baseline.p95_by_endpoint.get(&endpoint).copied().unwrap_or(0.0);
            if summary.p95_ms > 2.0 * (baseline_p95 + self.config.baseline_epsilon)
                && summary.p95_ms > self.config.latency_floor_ms
            {
                return Some(format!(
                    "{endpoint} p95 {:.0}ms vs baseline {baseline_p95:.0}ms",
                    summary.p95_ms
                ));
            }
        }
        None
    }

    fn trigger(&self, detail: &str) {
        error!(detail, "sustained post-deploy regression; rolling back");
        self.alerts.send(Alert::new(
            Severity::Critical,
            "Auto-rollback triggered",
            detail.to_string(),
        ));
        if let Err(err) = self.incidents.create_incident(IncidentSpec {
            priority: IncidentPriority::P1,
            title: "Post-deploy regression; automatic rollback".to_string(),
            invariant: None,
            details: json!({ "spike": detail }),
        }) {
            error!(error = %err, "failed to open rollback incident");
        }
        self.registry.increment("rollback.triggered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Transports;
    use crate::storage::Storage;

    struct Fixture {
        watcher: RollbackWatcher,
        registry: Arc<MetricsRegistry>,
        latency: Arc<LatencyTracker>,
        storage: Storage,
    }

    fn fixture(config: RollbackConfig) -> Fixture {
        let storage = Storage::open_in_memory().expect("storage");
        let registry = Arc::new(MetricsRegistry::new());
        let latency = Arc::new(LatencyTracker::new());
        let clock: SharedClock = Arc::new(SystemClock);
        let (alerts, _worker) = AlertDispatcher::new(Transports::default(), Arc::clone(&registry));
        let incidents = Arc::new(IncidentManager::new(
            storage.clone(),
            alerts.clone(),
            Arc::clone(&clock),
            Arc::clone(&registry),
        ));
        let watcher = RollbackWatcher::new(
            Arc::clone(&registry),
            Arc::clone(&latency),
            alerts,
            incidents,
            clock,
            config,
        );
        Fixture {
            watcher,
            registry,
            latency,
            storage,
        }
    }

    fn fast_config() -> RollbackConfig {
        RollbackConfig {
            poll_interval: Duration::from_millis(20),
            spike_window: Duration::from_millis(60),
            ..RollbackConfig::default()
        }
    }

    #[tokio::test]
    async fn sustained_error_spike_triggers_rollback() {
        let f = fixture(fast_config());
        // Baseline is clean; then errors jump and stay.
        f.registry.set_gauge("http.error_rate", 0.2);
        let rolled_back = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rolled_back);
        let handle = f.watcher.start(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        f.registry.set_gauge("http.error_rate", 9.0);
        handle.join().await;
        assert!(rolled_back.load(Ordering::SeqCst));
        assert_eq!(f.storage.open_incident_counts().expect("counts").p1, 1);
        assert_eq!(f.registry.counter("rollback.triggered"), 1);
    }

    #[tokio::test]
    async fn clearing_spike_resets_the_window() {
        let f = fixture(RollbackConfig {
            poll_interval: Duration::from_millis(15),
            spike_window: Duration::from_millis(200),
            ..RollbackConfig::default()
        });
        f.registry.set_gauge("http.error_rate", 0.0);
        let rolled_back = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rolled_back);
        let handle = f.watcher.start(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        // Spike, then clear before the window ends.
        f.registry.set_gauge("http.error_rate", 9.0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        f.registry.set_gauge("http.error_rate", 0.1);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!rolled_back.load(Ordering::SeqCst));
        assert!(!handle.triggered());
        handle.stop();
        handle.join().await;
        assert_eq!(f.storage.open_incident_counts().expect("counts").total(), 0);
    }

    #[tokio::test]
    async fn latency_spike_against_endpoint_baseline() {
        let f = fixture(fast_config());
        let now = chrono::Utc::now().timestamp_millis();
        for _ in 0..50 {
            f.latency.record("POST /sales", 100.0, now);
        }
        let rolled_back = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rolled_back);
        let handle = f.watcher.start(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        // p95 jumps to 800ms: above 2x baseline (100) and the 500ms floor.
        for _ in 0..200 {
            f.latency.record("POST /sales", 800.0, now + 10);
        }
        handle.join().await;
        assert!(rolled_back.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn healthy_deploy_is_left_alone() {
        let f = fixture(fast_config());
        f.registry.set_gauge("http.error_rate", 0.5);
        let handle = f.watcher.start(Box::new(|| {
            panic!("rollback must not fire");
        }));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop();
        assert!(!handle.triggered());
        handle.join().await;
    }
}
