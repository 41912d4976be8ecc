//! Cron scheduler for the control plane's periodic jobs.
//!
//! Each registered job gets its own task: an optional first invocation at
//! a random stagger inside the startup window (so eight jobs do not slam
//! the store in the same second), then a steady interval. Jobs run
//! concurrently with handlers and with each other; nothing serializes
//! them.
//!
//! Failures are contained at the job boundary: an error updates the job's
//! stats and raises an alert, a panic additionally opens a P2 incident.
//! Neither ever tears down the scheduler or the process. Shutdown is
//! cooperative via a watch channel, with a bounded drain.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use aegis_core::incident::IncidentPriority;
use aegis_core::metrics::{MetricsRegistry, Severity};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::incidents::{IncidentManager, IncidentSpec};

/// Startup stagger window for `run_on_start` jobs.
pub const STARTUP_STAGGER: Duration = Duration::from_secs(10);

/// Boxed job future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Error a job may surface.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Job body: invoked once per firing.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<Result<(), JobError>> + Send + Sync>;

/// One registered job.
pub struct JobSpec {
    /// Job name, used in metrics and the status board.
    pub name: String,
    /// Steady firing interval.
    pub interval: Duration,
    /// Whether to fire once during the startup window.
    pub run_on_start: bool,
    /// Job body.
    pub task: JobFn,
}

impl JobSpec {
    /// Creates a job spec from an async closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        run_on_start: bool,
        task: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            run_on_start,
            task: Arc::new(move || -> BoxFuture<Result<(), JobError>> { Box::pin(task()) }),
        }
    }
}

/// Per-job execution stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    /// Unix-ms timestamp of the last firing.
    pub last_run: Option<i64>,
    /// Error message of the most recent failed firing.
    pub last_error: Option<String>,
    /// Total firings.
    pub run_count: u64,
}

/// Shared status board exposed at `/cron/status`.
pub type CronStatusBoard = Arc<RwLock<HashMap<String, JobStats>>>;

/// The scheduler, before start.
pub struct Scheduler {
    jobs: Vec<JobSpec>,
    stats: CronStatusBoard,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    alerts: AlertDispatcher,
    incidents: Arc<IncidentManager>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new(
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        alerts: AlertDispatcher,
        incidents: Arc<IncidentManager>,
    ) -> Self {
        Self {
            jobs: Vec::new(),
            stats: Arc::new(RwLock::new(HashMap::new())),
            clock,
            registry,
            alerts,
            incidents,
        }
    }

    /// Registers a job.
    pub fn register(&mut self, spec: JobSpec) {
        self.stats
            .write()
            .expect("stats lock poisoned")
            .insert(spec.name.clone(), JobStats::default());
        self.jobs.push(spec);
    }

    /// Shared status board handle, valid before and after start.
    #[must_use]
    pub fn status_board(&self) -> CronStatusBoard {
        Arc::clone(&self.stats)
    }

    /// Spawns every job and returns the running handle.
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.jobs.len());
        info!(jobs = self.jobs.len(), "scheduler starting");

        for spec in self.jobs {
            let runner = JobRunner {
                name: spec.name.clone(),
                interval: spec.interval,
                run_on_start: spec.run_on_start,
                task: spec.task,
                stats: Arc::clone(&self.stats),
                clock: Arc::clone(&self.clock),
                registry: Arc::clone(&self.registry),
                alerts: self.alerts.clone(),
                incidents: Arc::clone(&self.incidents),
            };
            handles.push(runner.spawn(shutdown_rx.clone()));
        }

        SchedulerHandle {
            shutdown: shutdown_tx,
            handles,
            stats: self.stats,
        }
    }
}

/// Handle to the running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: CronStatusBoard,
}

impl SchedulerHandle {
    /// Shared status board handle.
    #[must_use]
    pub fn status_board(&self) -> CronStatusBoard {
        Arc::clone(&self.stats)
    }

    /// Signals shutdown and waits up to `grace` for jobs to drain.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("scheduler drain exceeded grace period");
        } else {
            info!("scheduler drained");
        }
    }
}

struct JobRunner {
    name: String,
    interval: Duration,
    run_on_start: bool,
    task: JobFn,
    stats: CronStatusBoard,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    alerts: AlertDispatcher,
    incidents: Arc<IncidentManager>,
}

impl JobRunner {
    fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.run_on_start {
                let stagger = Duration::from_millis(
                    rand::thread_rng().gen_range(0..STARTUP_STAGGER.as_millis() as u64),
                );
                tokio::select! {
                    _ = shutdown.changed() => return,
                    () = tokio::time::sleep(stagger) => {}
                }
                self.fire().await;
            }

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {}
                }
                self.fire().await;
            }
        })
    }

    async fn fire(&self) {
        let now = self.clock.now_ms();
        // Each invocation runs in its own task so a panic is contained and
        // surfaces as a join error.
        let task = Arc::clone(&self.task);
        let outcome = tokio::spawn(async move { task().await }).await;

        let mut stats = self.stats.write().expect("stats lock poisoned");
        let entry = stats.entry(self.name.clone()).or_default();
        entry.last_run = Some(now);
        entry.run_count += 1;
        #[allow(clippy::cast_precision_loss)]
        self.registry
            .set_gauge(&format!("cron.{}.last_run_ms", self.name), now as f64);

        match outcome {
            Ok(Ok(())) => {
                entry.last_error = None;
                drop(stats);
                self.registry
                    .increment(&format!("cron.{}.success_total", self.name));
            },
            Ok(Err(err)) => {
                let message = err.to_string();
                entry.last_error = Some(message.clone());
                drop(stats);
                self.registry
                    .increment(&format!("cron.{}.error_total", self.name));
                warn!(job = %self.name, error = %message, "job failed");
                self.alerts.send(Alert::new(
                    Severity::High,
                    format!("Scheduled job failed: {}", self.name),
                    message,
                ));
            },
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("job panicked: {join_err}")
                } else {
                    format!("job cancelled: {join_err}")
                };
                entry.last_error = Some(message.clone());
                drop(stats);
                self.registry
                    .increment(&format!("cron.{}.error_total", self.name));
                error!(job = %self.name, error = %message, "job crashed");
                self.alerts.send(Alert::new(
                    Severity::Critical,
                    format!("Scheduled job crashed: {}", self.name),
                    message.clone(),
                ));
                if let Err(err) = self.incidents.create_incident(IncidentSpec {
                    priority: IncidentPriority::P2,
                    title: format!("Scheduled job crashed: {}", self.name),
                    invariant: None,
                    details: json!({ "job": self.name, "error": message }),
                }) {
                    error!(error = %err, "failed to open job-crash incident");
                }
            },
        }
    }
}
