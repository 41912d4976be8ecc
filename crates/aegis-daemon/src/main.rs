//! aegis-daemon binary: wiring and lifecycle.
//!
//! Construction order follows the dependency graph: store, metrics, alert
//! transport, incident manager, then the engines, then the scheduler and
//! the HTTP surface. Every component receives its collaborators explicitly;
//! nothing is wired through globals.
//!
//! Shutdown is cooperative: SIGTERM/SIGINT stops accepting requests, then
//! the scheduler drains running jobs within a bounded grace period.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aegis_core::latency::LatencyTracker;
use aegis_core::metrics::{MetricThreshold, MetricsRegistry, Severity, ThresholdOp};
use anyhow::{Context, Result};
use aegis_daemon::alert::AlertDispatcher;
use aegis_daemon::backup::BackupValidator;
use aegis_daemon::clock::{SharedClock, SystemClock};
use aegis_daemon::config::DaemonConfig;
use aegis_daemon::gates::{DeploymentGateRunner, GateConfig};
use aegis_daemon::health::HealthScorer;
use aegis_daemon::http::{self, AppInner, AppState};
use aegis_daemon::idempotency::IdempotencyRegistry;
use aegis_daemon::incidents::IncidentManager;
use aegis_daemon::invariants::InvariantEngine;
use aegis_daemon::perf::{PerfConfig, PerformanceEngine};
use aegis_daemon::report::ExecutiveReporter;
use aegis_daemon::scheduler::{JobSpec, Scheduler};
use aegis_daemon::security::{SecurityConfig, SecurityEngine};
use aegis_daemon::storage::Storage;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Grace period for scheduler drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Memory sampling cadence.
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// aegis operations control plane
#[derive(Parser, Debug)]
#[command(name = "aegis-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the shared SQLite database
    #[arg(long, default_value = "aegis.db")]
    db: PathBuf,

    /// Listen address for the control-plane HTTP surface
    #[arg(long, default_value = "127.0.0.1:9600")]
    listen: SocketAddr,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

fn default_thresholds() -> Vec<MetricThreshold> {
    vec![
        MetricThreshold::new(
            "http.error_rate",
            ThresholdOp::GreaterThan,
            5.0,
            Severity::High,
            Duration::from_secs(300),
        ),
        MetricThreshold::new(
            "db.pool.saturation",
            ThresholdOp::GreaterThan,
            85.0,
            Severity::High,
            Duration::from_secs(300),
        ),
        MetricThreshold::new(
            "perf.overload_risk",
            ThresholdOp::GreaterOrEqual,
            70.0,
            Severity::Critical,
            Duration::from_secs(600),
        ),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = args
        .log
        .clone()
        .map_or_else(
            || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            EnvFilter::new,
        );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "unhandled panic");
    }));

    let config = DaemonConfig::from_env();
    info!(stage = ?config.stage, db = %args.db.display(), "aegis daemon starting");

    let storage = Storage::open(&args.db).context("opening store")?;
    let clock: SharedClock = Arc::new(SystemClock);
    let registry = Arc::new(MetricsRegistry::with_thresholds(default_thresholds()));
    let latency = Arc::new(LatencyTracker::new());

    let (alerts, alert_worker) =
        AlertDispatcher::new(config.transports.clone(), Arc::clone(&registry));
    tokio::spawn(alert_worker.run());
    alerts.bind_threshold_breaches(&registry);

    let incidents = Arc::new(IncidentManager::new(
        storage.clone(),
        alerts.clone(),
        Arc::clone(&clock),
        Arc::clone(&registry),
    ));
    let invariants = Arc::new(InvariantEngine::new(
        storage.clone(),
        Arc::clone(&incidents),
        Arc::clone(&clock),
        Arc::clone(&registry),
    ));
    let security = Arc::new(SecurityEngine::new(
        storage.clone(),
        Arc::clone(&incidents),
        alerts.clone(),
        Arc::clone(&clock),
        Arc::clone(&registry),
        SecurityConfig::default(),
        config.rate_limit_per_minute,
    ));
    let perf = Arc::new(PerformanceEngine::new(
        storage.clone(),
        Arc::clone(&incidents),
        alerts.clone(),
        Arc::clone(&clock),
        Arc::clone(&registry),
        Arc::clone(&latency),
        PerfConfig::default(),
    ));
    let health = Arc::new(HealthScorer::new(
        storage.clone(),
        Arc::clone(&incidents),
        alerts.clone(),
        Arc::clone(&clock),
        Arc::clone(&registry),
    ));
    let idempotency = Arc::new(
        IdempotencyRegistry::new(storage.clone(), Arc::clone(&clock), Arc::clone(&registry))
            .with_ttl(config.idempotency_ttl),
    );
    let reporter = Arc::new(ExecutiveReporter::new(
        storage.clone(),
        Arc::clone(&clock),
        Arc::clone(&registry),
        config.transports.executive_webhook_url.clone(),
    ));
    let backup = Arc::new(BackupValidator::new(
        storage.clone(),
        Arc::clone(&incidents),
        Arc::clone(&clock),
        Arc::clone(&registry),
        config.backup_dir.clone(),
        config.shadow_db_url.clone(),
    ));

    // Deployment gates at boot, production only. A blocked gate run aborts
    // the deploy before the daemon takes traffic.
    if config.stage.gates_at_boot() {
        let runner = DeploymentGateRunner::new(
            storage.clone(),
            alerts.clone(),
            Arc::clone(&clock),
            Arc::clone(&registry),
            GateConfig::default(),
        );
        runner
            .run(Some("boot"))
            .await
            .context("deployment gates blocked the boot")?;
    }

    let mut scheduler = Scheduler::new(
        Arc::clone(&clock),
        Arc::clone(&registry),
        alerts.clone(),
        Arc::clone(&incidents),
    );
    {
        let invariants = Arc::clone(&invariants);
        scheduler.register(JobSpec::new(
            "invariant-check",
            config.intervals.invariant,
            true,
            move || {
                let invariants = Arc::clone(&invariants);
                async move {
                    invariants.run_cycle()?;
                    Ok(())
                }
            },
        ));
    }
    {
        let perf_engine = Arc::clone(&perf);
        scheduler.register(JobSpec::new(
            "perf-analysis",
            config.intervals.perf,
            true,
            move || {
                let perf_engine = Arc::clone(&perf_engine);
                async move {
                    perf_engine.run_analysis()?;
                    Ok(())
                }
            },
        ));
    }
    {
        let perf_engine = Arc::clone(&perf);
        scheduler.register(JobSpec::new(
            "memory-sample",
            MEMORY_SAMPLE_INTERVAL,
            true,
            move || {
                let perf_engine = Arc::clone(&perf_engine);
                async move {
                    perf_engine.sample_memory();
                    Ok(())
                }
            },
        ));
    }
    {
        let security_engine = Arc::clone(&security);
        scheduler.register(JobSpec::new(
            "security-scan",
            config.intervals.security,
            true,
            move || {
                let security_engine = Arc::clone(&security_engine);
                async move {
                    security_engine.run_scan()?;
                    security_engine.verify_audit_chain()?;
                    Ok(())
                }
            },
        ));
    }
    {
        let health_scorer = Arc::clone(&health);
        scheduler.register(JobSpec::new(
            "health-score",
            config.intervals.health,
            true,
            move || {
                let health_scorer = Arc::clone(&health_scorer);
                async move {
                    health_scorer.compute()?;
                    Ok(())
                }
            },
        ));
    }
    {
        let backup = Arc::clone(&backup);
        scheduler.register(JobSpec::new(
            "backup-validation",
            config.intervals.backup,
            true,
            move || {
                let backup = Arc::clone(&backup);
                async move {
                    backup.run_validation()?;
                    Ok(())
                }
            },
        ));
    }
    {
        let reporter = Arc::clone(&reporter);
        scheduler.register(JobSpec::new(
            "executive-report",
            config.intervals.exec_report,
            false,
            move || {
                let reporter = Arc::clone(&reporter);
                async move {
                    reporter.generate_and_dispatch().await?;
                    Ok(())
                }
            },
        ));
    }
    {
        let idempotency = Arc::clone(&idempotency);
        scheduler.register(JobSpec::new(
            "idempotency-gc",
            config.intervals.idempotency_clean,
            false,
            move || {
                let idempotency = Arc::clone(&idempotency);
                async move {
                    idempotency.gc()?;
                    Ok(())
                }
            },
        ));
    }
    {
        let security_engine = Arc::clone(&security);
        scheduler.register(JobSpec::new(
            "ratelimit-cleanup",
            config.intervals.ratelimit_clean,
            false,
            move || {
                let security_engine = Arc::clone(&security_engine);
                async move {
                    security_engine.cleanup_windows();
                    Ok(())
                }
            },
        ));
    }
    let cron = scheduler.status_board();
    let scheduler_handle = scheduler.start();

    let state = AppState::new(AppInner {
        storage,
        registry,
        clock,
        latency,
        security,
        health,
        incidents,
        reporter,
        cron,
    });
    let router = http::router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %args.listen, "control plane serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("draining scheduler");
    scheduler_handle.shutdown(SHUTDOWN_GRACE).await;
    info!("aegis daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "cannot install SIGTERM handler");
            return std::future::pending().await;
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
}
