//! Deployment gates.
//!
//! The runner evaluates a fixed set of predicates concurrently; every gate
//! is blocking. A gate that fails internally (query error, subprocess
//! failure) becomes a failed blocking result carrying the error — a deploy
//! must never pass because a precondition could not be checked. The run is
//! persisted as one row; any failed blocker emits a CRITICAL alert and
//! aborts the deploy with [`GateError::Blocked`].

use std::sync::Arc;
use std::time::Duration;

use aegis_core::metrics::{MetricsRegistry, Severity};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::storage::{Storage, StorageError};

/// Gate names, part of the operational contract.
pub const GATE_NO_OPEN_P1: &str = "NO_OPEN_P1_INCIDENTS";
/// Drift-score gate name.
pub const GATE_DRIFT_SCORE: &str = "DRIFT_SCORE";
/// Coverage gate name.
pub const GATE_TEST_COVERAGE: &str = "TEST_COVERAGE";
/// Backup-freshness gate name.
pub const GATE_BACKUP_FRESHNESS: &str = "BACKUP_FRESHNESS";
/// Error-rate gate name.
pub const GATE_ERROR_RATE: &str = "ERROR_RATE";
/// Migration gate name.
pub const GATE_MIGRATIONS_CLEAN: &str = "MIGRATIONS_CLEAN";

/// Timeout for the injected coverage command.
pub const COVERAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Gate evaluation thresholds.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Minimum acceptable drift score.
    pub drift_score_min: u8,
    /// Minimum acceptable line coverage percentage.
    pub coverage_min_pct: f64,
    /// Injected command printing the coverage percentage on stdout.
    pub coverage_command: Option<Vec<String>>,
    /// Skips the coverage gate entirely.
    pub skip_coverage: bool,
    /// Maximum age of the newest PASSED backup validation, in hours.
    pub backup_max_age_hours: f64,
    /// Maximum acceptable `http.error_rate` gauge value.
    pub error_rate_max_pct: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            drift_score_min: 85,
            coverage_min_pct: 85.0,
            coverage_command: None,
            skip_coverage: false,
            backup_max_age_hours: 24.0,
            error_rate_max_pct: 3.0,
        }
    }
}

/// Outcome of one gate predicate.
#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    /// Gate name.
    pub name: String,
    /// Whether the gate passed.
    pub passed: bool,
    /// Human-readable explanation.
    pub detail: String,
    /// Whether failure blocks the deploy. All current gates block.
    pub blocking: bool,
}

impl GateResult {
    fn passed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.into(),
            blocking: true,
        }
    }

    fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
            blocking: true,
        }
    }
}

/// Outcome of one full gate run.
#[derive(Debug, Clone, Serialize)]
pub struct GateRunOutcome {
    /// Persisted run id.
    pub run_id: String,
    /// Whether every blocker passed.
    pub passed: bool,
    /// Individual gate results.
    pub gates: Vec<GateResult>,
}

/// Errors surfaced by the runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    /// Storage failure while persisting the run.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// One or more blocking gates failed; the deploy must abort.
    #[error("deployment blocked by gates: {}", blockers.join(", "))]
    Blocked {
        /// Names of the failed blocking gates.
        blockers: Vec<String>,
        /// Persisted run id.
        run_id: String,
    },
}

/// The deployment gate runner.
pub struct DeploymentGateRunner {
    storage: Storage,
    alerts: AlertDispatcher,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    config: GateConfig,
}

impl DeploymentGateRunner {
    /// Creates the runner.
    #[must_use]
    pub fn new(
        storage: Storage,
        alerts: AlertDispatcher,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        config: GateConfig,
    ) -> Self {
        Self {
            storage,
            alerts,
            clock,
            registry,
            config,
        }
    }

    /// Evaluates all gates, persists the run, and aborts on blockers.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Blocked`] when any blocking gate failed, or a
    /// storage error when the run cannot be persisted.
    pub async fn run(&self, triggered_by: Option<&str>) -> Result<GateRunOutcome, GateError> {
        let (p1, drift, coverage, backup, error_rate, migrations) = tokio::join!(
            self.gate_no_open_p1(),
            self.gate_drift_score(),
            self.gate_test_coverage(),
            self.gate_backup_freshness(),
            self.gate_error_rate(),
            self.gate_migrations_clean(),
        );
        let gates = vec![p1, drift, coverage, backup, error_rate, migrations];

        let blockers: Vec<String> = gates
            .iter()
            .filter(|g| g.blocking && !g.passed)
            .map(|g| g.name.clone())
            .collect();
        let passed = blockers.is_empty();

        let run_id = self.storage.insert_gate_run(
            passed,
            &serde_json::to_value(&gates).unwrap_or_else(|_| json!([])),
            &json!(blockers),
            triggered_by,
            self.clock.now_ms(),
        )?;
        self.registry.increment(if passed {
            "gates.runs_passed"
        } else {
            "gates.runs_blocked"
        });

        if passed {
            info!(run_id, "deployment gates passed");
            Ok(GateRunOutcome {
                run_id,
                passed,
                gates,
            })
        } else {
            warn!(run_id, blockers = ?blockers, "deployment blocked");
            self.alerts.send(Alert::new(
                Severity::Critical,
                "Deployment blocked",
                format!("failed gates: {}", blockers.join(", ")),
            ));
            Err(GateError::Blocked { blockers, run_id })
        }
    }

    async fn gate_no_open_p1(&self) -> GateResult {
        match self.storage.open_incident_counts() {
            Ok(counts) if counts.p1 == 0 => {
                GateResult::passed(GATE_NO_OPEN_P1, "no open P1 incidents")
            },
            Ok(counts) => GateResult::failed(
                GATE_NO_OPEN_P1,
                format!("{} open P1 incident(s)", counts.p1),
            ),
            Err(err) => GateResult::failed(GATE_NO_OPEN_P1, err.to_string()),
        }
    }

    async fn gate_drift_score(&self) -> GateResult {
        match self.storage.latest_drift_score() {
            Ok(Some((score, _))) if score >= self.config.drift_score_min => {
                GateResult::passed(GATE_DRIFT_SCORE, format!("drift score {score}"))
            },
            Ok(Some((score, _))) => GateResult::failed(
                GATE_DRIFT_SCORE,
                format!(
                    "drift score {score} below {}",
                    self.config.drift_score_min
                ),
            ),
            Ok(None) => GateResult::failed(GATE_DRIFT_SCORE, "no drift sample recorded"),
            Err(err) => GateResult::failed(GATE_DRIFT_SCORE, err.to_string()),
        }
    }

    async fn gate_test_coverage(&self) -> GateResult {
        if self.config.skip_coverage {
            return GateResult::passed(GATE_TEST_COVERAGE, "skipped by flag");
        }
        let Some(command) = self.config.coverage_command.clone() else {
            return GateResult::failed(GATE_TEST_COVERAGE, "coverage command not configured");
        };
        let Some((program, args)) = command.split_first() else {
            return GateResult::failed(GATE_TEST_COVERAGE, "coverage command empty");
        };
        let output = tokio::time::timeout(
            COVERAGE_TIMEOUT,
            tokio::process::Command::new(program).args(args).output(),
        )
        .await;
        match output {
            Err(_) => GateResult::failed(GATE_TEST_COVERAGE, "coverage command timed out"),
            Ok(Err(err)) => GateResult::failed(GATE_TEST_COVERAGE, err.to_string()),
            Ok(Ok(output)) if !output.status.success() => GateResult::failed(
                GATE_TEST_COVERAGE,
                format!("coverage command exited {}", output.status),
            ),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                match stdout.trim().parse::<f64>() {
                    Ok(pct) if pct >= self.config.coverage_min_pct => {
                        GateResult::passed(GATE_TEST_COVERAGE, format!("line coverage {pct}%"))
                    },
                    Ok(pct) => GateResult::failed(
                        GATE_TEST_COVERAGE,
                        format!(
                            "line coverage {pct}% below {}%",
                            self.config.coverage_min_pct
                        ),
                    ),
                    Err(_) => GateResult::failed(
                        GATE_TEST_COVERAGE,
                        format!("unparseable coverage output: {:?}", stdout.trim()),
                    ),
                }
            },
        }
    }

    async fn gate_backup_freshness(&self) -> GateResult {
        match self.storage.latest_passed_backup() {
            Ok(Some(validated_at)) => {
                #[allow(clippy::cast_precision_loss)]
                let age_hours = (self.clock.now_ms() - validated_at) as f64 / 3_600_000.0;
                if age_hours < self.config.backup_max_age_hours {
                    GateResult::passed(
                        GATE_BACKUP_FRESHNESS,
                        format!("newest passed backup is {age_hours:.1}h old"),
                    )
                } else {
                    GateResult::failed(
                        GATE_BACKUP_FRESHNESS,
                        format!("newest passed backup is {age_hours:.1}h old"),
                    )
                }
            },
            Ok(None) => GateResult::failed(GATE_BACKUP_FRESHNESS, "no passed backup validation"),
            Err(err) => GateResult::failed(GATE_BACKUP_FRESHNESS, err.to_string()),
        }
    }

    async fn gate_error_rate(&self) -> GateResult {
        let rate = self.registry.gauge("http.error_rate");
        if rate <= self.config.error_rate_max_pct {
            GateResult::passed(GATE_ERROR_RATE, format!("error rate {rate:.2}%"))
        } else {
            GateResult::failed(
                GATE_ERROR_RATE,
                format!(
                    "error rate {rate:.2}% above {:.2}%",
                    self.config.error_rate_max_pct
                ),
            )
        }
    }

    async fn gate_migrations_clean(&self) -> GateResult {
        match self.storage.pending_migrations() {
            Ok(0) => GateResult::passed(GATE_MIGRATIONS_CLEAN, "no pending migrations"),
            Ok(pending) => GateResult::failed(
                GATE_MIGRATIONS_CLEAN,
                format!("{pending} pending migration(s)"),
            ),
            Err(err) => GateResult::failed(GATE_MIGRATIONS_CLEAN, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Transports;

    fn runner(config: GateConfig) -> (DeploymentGateRunner, Storage, Arc<MetricsRegistry>) {
        let storage = Storage::open_in_memory().expect("storage");
        let registry = Arc::new(MetricsRegistry::new());
        let clock = Arc::new(ManualClock::new(10_000_000));
        let (alerts, _worker) = AlertDispatcher::new(Transports::default(), Arc::clone(&registry));
        let runner = DeploymentGateRunner::new(
            storage.clone(),
            alerts,
            clock as SharedClock,
            Arc::clone(&registry),
            config,
        );
        (runner, storage, registry)
    }

    fn healthy_config() -> GateConfig {
        GateConfig {
            skip_coverage: true,
            ..GateConfig::default()
        }
    }

    fn make_healthy(storage: &Storage) {
        storage
            .insert_drift_score(95, &json!({}), 9_999_000)
            .expect("drift");
        storage
            .insert_backup_validation(&crate::storage::BackupValidationRow {
                id: "b1".to_string(),
                backup_file: "dump.sql.gz".to_string(),
                size_kb: 100,
                checksum: None,
                restore_tested: true,
                drift_clean: true,
                incident_id: None,
                validated_at: 9_000_000,
                status: "PASSED".to_string(),
            })
            .expect("backup");
    }

    #[tokio::test]
    async fn healthy_system_passes_all_gates() {
        let (runner, storage, _registry) = runner(healthy_config());
        make_healthy(&storage);
        let outcome = runner.run(Some("ci")).await.expect("run");
        assert!(outcome.passed);
        assert_eq!(outcome.gates.len(), 6);
        assert!(outcome.gates.iter().all(|g| g.passed && g.blocking));
    }

    #[tokio::test]
    async fn open_p1_blocks_the_deploy() {
        let (runner, storage, registry) = runner(healthy_config());
        make_healthy(&storage);
        storage
            .insert_incident(&crate::storage::IncidentRow {
                id: "p1".to_string(),
                priority: aegis_core::incident::IncidentPriority::P1,
                status: aegis_core::incident::IncidentStatus::Open,
                title: "x".to_string(),
                invariant: None,
                details: json!({}),
                forensic: json!({}),
                auto_heal_attempts: 0,
                auto_healed: false,
                created_at: 9_000_000,
                updated_at: 9_000_000,
                resolved_at: None,
                escalated_at: None,
                resolved_by: None,
                resolved_reason: None,
            })
            .expect("insert");

        let outcome = runner.run(None).await;
        let Err(GateError::Blocked { blockers, run_id }) = outcome else {
            panic!("expected blocked deploy");
        };
        assert_eq!(blockers, vec![GATE_NO_OPEN_P1.to_string()]);
        assert!(!run_id.is_empty());
        assert_eq!(registry.counter("gates.runs_blocked"), 1);
    }

    #[tokio::test]
    async fn low_drift_and_stale_backup_block_together() {
        let (runner, storage, _registry) = runner(healthy_config());
        storage
            .insert_drift_score(70, &json!({}), 9_999_000)
            .expect("drift");
        // No backup at all.
        let Err(GateError::Blocked { blockers, .. }) = runner.run(None).await else {
            panic!("expected blocked deploy");
        };
        assert!(blockers.contains(&GATE_DRIFT_SCORE.to_string()));
        assert!(blockers.contains(&GATE_BACKUP_FRESHNESS.to_string()));
    }

    #[tokio::test]
    async fn elevated_error_rate_blocks() {
        let (runner, storage, registry) = runner(healthy_config());
        make_healthy(&storage);
        registry.set_gauge("http.error_rate", 4.5);
        let Err(GateError::Blocked { blockers, .. }) = runner.run(None).await else {
            panic!("expected blocked deploy");
        };
        assert_eq!(blockers, vec![GATE_ERROR_RATE.to_string()]);
    }

    #[tokio::test]
    async fn coverage_command_runs_and_parses() {
        let mut config = GateConfig {
            coverage_command: Some(vec!["echo".to_string(), "91.4".to_string()]),
            ..GateConfig::default()
        };
        config.skip_coverage = false;
        let (runner, storage, _registry) = runner(config);
        make_healthy(&storage);
        let outcome = runner.run(None).await.expect("run");
        let coverage = outcome
            .gates
            .iter()
            .find(|g| g.name == GATE_TEST_COVERAGE)
            .expect("gate");
        assert!(coverage.passed);
        assert!(coverage.detail.contains("91.4"));
    }

    #[tokio::test]
    async fn missing_coverage_command_fails_closed() {
        let config = GateConfig {
            skip_coverage: false,
            coverage_command: None,
            ..GateConfig::default()
        };
        let (runner, storage, _registry) = runner(config);
        make_healthy(&storage);
        let Err(GateError::Blocked { blockers, .. }) = runner.run(None).await else {
            panic!("expected blocked deploy");
        };
        assert_eq!(blockers, vec![GATE_TEST_COVERAGE.to_string()]);
    }
}
