//! Health scorer and safe-mode management.
//!
//! Every cycle composes the six component scores (integrity, error rate,
//! latency, incidents, backup freshness, migrations) into one 0–100 score,
//! persists the sample, and manages the safe-mode singleton: a grade-F
//! score engages safe mode atomically; scores in the 40–49 band page
//! without engaging. Disabling requires the stored override token, and the
//! comparison happens inside the same statement that clears the flag.

use std::sync::Arc;

use aegis_core::incident::IncidentPriority;
use aegis_core::metrics::{MetricsRegistry, Severity};
use aegis_core::scoring::{
    score_backup, score_error_rate, score_incidents, score_integrity, score_latency,
    score_migrations, HealthComponents, HealthGrade,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::incidents::{IncidentManager, IncidentSpec};
use crate::storage::{SafeModeState, Storage, StorageResult};

/// Incident marker used to dedupe migration-probe incidents.
pub const MIGRATION_PROBE_INCIDENT: &str = "MIGRATION_STATUS_UNKNOWN";

/// Reason recorded when the scorer engages safe mode on its own.
pub const AUTO_ENGAGE_REASON: &str = "Health score F — auto-engaged";

/// One computed health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Composite 0–100 score.
    pub score: u8,
    /// Grade band for the score.
    pub grade: HealthGrade,
    /// Component breakdown.
    pub components: HealthComponents,
    /// Whether safe mode is engaged after this compute.
    pub safe_mode: bool,
    /// Compute time (unix ms).
    pub recorded_at: i64,
}

/// The health scorer.
pub struct HealthScorer {
    storage: Storage,
    incidents: Arc<IncidentManager>,
    alerts: AlertDispatcher,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
}

impl HealthScorer {
    /// Creates the scorer.
    #[must_use]
    pub fn new(
        storage: Storage,
        incidents: Arc<IncidentManager>,
        alerts: AlertDispatcher,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            storage,
            incidents,
            alerts,
            clock,
            registry,
        }
    }

    /// Computes, persists, and reacts to one health sample.
    ///
    /// # Errors
    ///
    /// Returns an error when reading inputs or persisting the sample fails.
    pub fn compute(&self) -> StorageResult<HealthReport> {
        let now = self.clock.now_ms();

        // A store with no drift sample yet scores as clean: nothing has
        // been measured, and an empty system must not boot into safe mode.
        let drift = self
            .storage
            .latest_drift_score()?
            .map_or(100, |(score, _)| score);
        let counts = self.storage.open_incident_counts()?;
        let backup_age_hours = self
            .storage
            .latest_passed_backup()?
            .map(|at| (now - at) as f64 / 3_600_000.0);
        let migrations = match self.storage.pending_migrations() {
            Ok(pending) => Ok(pending == 0),
            Err(err) => {
                warn!(error = %err, "migration probe failed");
                self.open_migration_probe_incident(&err.to_string());
                Err(())
            },
        };

        let components = HealthComponents {
            integrity: score_integrity(drift),
            error_rate: score_error_rate(self.registry.gauge("http.error_rate")),
            latency: score_latency(self.registry.percentile("http.request_duration_ms", 95.0)),
            incidents: score_incidents(counts.p1, counts.p2, counts.p3, counts.p4),
            backup: score_backup(backup_age_hours),
            migrations: score_migrations(migrations),
        };
        let score = components.score();
        let grade = HealthGrade::from_score(score);
        self.registry.set_gauge("health.score", f64::from(score));

        let mut safe_mode = self.storage.safe_mode_state()?.safe_mode;
        if grade == HealthGrade::F && !safe_mode {
            let token = Uuid::new_v4().to_string();
            if self
                .storage
                .enable_safe_mode(AUTO_ENGAGE_REASON, "health-scorer", &token, now)?
            {
                safe_mode = true;
                error!(score, "safe mode auto-engaged");
                self.alerts.send(Alert::new(
                    Severity::Critical,
                    "Safe mode engaged",
                    format!("Health score {score} (grade F); mutations are now refused"),
                ));
            }
        } else if (40..50).contains(&score) {
            self.alerts.send(Alert::new(
                Severity::Critical,
                "Health score approaching failure",
                format!("Health score {score} (grade D)"),
            ));
        }

        let components_json = json!({
            "integrity": components.integrity,
            "errorRate": components.error_rate,
            "latency": components.latency,
            "incidents": components.incidents,
            "backup": components.backup,
            "migrations": components.migrations,
        });
        self.storage
            .insert_health_score(score, &components_json, safe_mode, now)?;

        info!(score, grade = %grade, safe_mode, "health computed");
        Ok(HealthReport {
            score,
            grade,
            components,
            safe_mode,
            recorded_at: now,
        })
    }

    /// Current safe-mode state.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn safe_mode_state(&self) -> StorageResult<SafeModeState> {
        self.storage.safe_mode_state()
    }

    /// Manually engages safe mode. Returns the override token required to
    /// disable it, or `None` when safe mode was already engaged.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn enable_safe_mode(
        &self,
        reason: &str,
        enabled_by: &str,
    ) -> StorageResult<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let engaged =
            self.storage
                .enable_safe_mode(reason, enabled_by, &token, self.clock.now_ms())?;
        if engaged {
            warn!(reason, enabled_by, "safe mode engaged manually");
            self.alerts.send(Alert::new(
                Severity::Critical,
                "Safe mode engaged",
                format!("by {enabled_by}: {reason}"),
            ));
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Disables safe mode iff the supplied token matches the stored one.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn disable_safe_mode(&self, override_token: &str) -> StorageResult<bool> {
        let disabled = self
            .storage
            .disable_safe_mode(override_token, self.clock.now_ms())?;
        if disabled {
            info!("safe mode disabled");
            self.alerts.send(Alert::new(
                Severity::High,
                "Safe mode disabled",
                "mutations are accepted again",
            ));
        } else {
            warn!("safe mode disable refused: token mismatch or not engaged");
        }
        Ok(disabled)
    }

    fn open_migration_probe_incident(&self, error: &str) {
        let already_open = self
            .storage
            .active_incident_for_invariant(MIGRATION_PROBE_INCIDENT)
            .ok()
            .flatten()
            .is_some();
        if already_open {
            return;
        }
        if let Err(err) = self.incidents.create_incident(IncidentSpec {
            priority: IncidentPriority::P3,
            title: "Migration status probe failed".to_string(),
            invariant: Some(MIGRATION_PROBE_INCIDENT.to_string()),
            details: json!({ "error": error }),
        }) {
            error!(error = %err, "failed to open migration-probe incident");
        }
    }
}
