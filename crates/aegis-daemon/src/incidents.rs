//! Incident manager.
//!
//! Owns the incident lifecycle: creation with forensic capture, the
//! auto-heal escalation ladder, idempotent escalation, and auto-resolve.
//! Every status change goes through the monotone transition rules in
//! [`aegis_core::incident`]; a terminal incident never moves again, and
//! escalation timestamps are written exactly once.
//!
//! The manager is a stateless façade over the store: concurrency is
//! resolved at the storage layer, and the manager never caches rows between
//! calls.

use std::sync::Arc;

use aegis_core::incident::{should_escalate, IncidentPriority, IncidentStatus};
use aegis_core::invariant::InvariantResult;
use aegis_core::metrics::MetricsRegistry;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::procinfo;
use crate::storage::{IncidentRow, OpenIncidentCounts, Storage, StorageError};

/// Errors surfaced by incident operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IncidentError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Unknown incident id.
    #[error("incident not found: {id}")]
    NotFound {
        /// The id that was not found.
        id: String,
    },
}

/// Result alias for incident operations.
pub type IncidentResult<T> = Result<T, IncidentError>;

/// Parameters for a new incident.
#[derive(Debug, Clone)]
pub struct IncidentSpec {
    /// Priority band.
    pub priority: IncidentPriority,
    /// Human-readable title.
    pub title: String,
    /// Invariant the incident tracks, if any.
    pub invariant: Option<String>,
    /// Diagnostic payload.
    pub details: serde_json::Value,
}

/// Open-incident summary for gates and dashboards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IncidentSummary {
    /// Open P1 incidents.
    pub p1_open: u32,
    /// Open P2 incidents.
    pub p2_open: u32,
    /// Open P3 incidents.
    pub p3_open: u32,
    /// Open P4 incidents.
    pub p4_open: u32,
    /// Total open incidents.
    pub total_open: u32,
}

impl From<OpenIncidentCounts> for IncidentSummary {
    fn from(counts: OpenIncidentCounts) -> Self {
        Self {
            p1_open: counts.p1,
            p2_open: counts.p2,
            p3_open: counts.p3,
            p4_open: counts.p4,
            total_open: counts.total(),
        }
    }
}

/// Process-wide incident manager.
pub struct IncidentManager {
    storage: Storage,
    alerts: AlertDispatcher,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    /// Daemon start, for the uptime forensic field.
    started_at_ms: i64,
}

impl IncidentManager {
    /// Creates the manager.
    #[must_use]
    pub fn new(
        storage: Storage,
        alerts: AlertDispatcher,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        let started_at_ms = clock.now_ms();
        Self {
            storage,
            alerts,
            clock,
            registry,
            started_at_ms,
        }
    }

    /// Creates an incident with a forensic snapshot and emits the alert for
    /// its priority. Returns the new id.
    ///
    /// # Errors
    ///
    /// Returns an error when the row cannot be persisted.
    pub fn create_incident(&self, spec: IncidentSpec) -> IncidentResult<String> {
        let now = self.clock.now_ms();
        let id = Uuid::new_v4().to_string();
        let row = IncidentRow {
            id: id.clone(),
            priority: spec.priority,
            status: IncidentStatus::Open,
            title: spec.title.clone(),
            invariant: spec.invariant,
            details: spec.details,
            forensic: self.forensic_snapshot(now),
            auto_heal_attempts: 0,
            auto_healed: false,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            escalated_at: None,
            resolved_by: None,
            resolved_reason: None,
        };
        self.storage.insert_incident(&row)?;
        self.registry.increment("incidents.created");
        warn!(incident = %id, priority = %spec.priority, title = %spec.title, "incident opened");
        self.alerts.send(Alert::new(
            spec.priority.alert_severity(),
            format!("[{}] {}", spec.priority, spec.title),
            format!("Incident {id} opened"),
        ));
        Ok(id)
    }

    /// Folds one invariant-cycle result into the incident state.
    ///
    /// With an active incident for the invariant: a passing result resolves
    /// it, a failing result climbs the heal ladder. Without one, a failing
    /// result opens a new incident.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn create_or_update_from_invariant(
        &self,
        result: &InvariantResult,
    ) -> IncidentResult<Option<String>> {
        let existing = self.storage.active_incident_for_invariant(&result.name)?;
        match existing {
            Some(incident) => {
                if result.passed {
                    let reason = if result.auto_corrected {
                        "violations auto-corrected"
                    } else {
                        "violations cleared"
                    };
                    self.auto_resolve(&incident.id, reason)?;
                } else {
                    self.increment_heal_attempts(&incident.id, result)?;
                }
                Ok(Some(incident.id))
            },
            None if !result.passed => {
                let id = self.create_incident(IncidentSpec {
                    priority: result.priority,
                    title: format!("Invariant violation: {}", result.name),
                    invariant: Some(result.name.clone()),
                    details: json!({
                        "violation_count": result.violation_count(),
                        "auto_corrected": result.auto_corrected,
                    }),
                })?;
                Ok(Some(id))
            },
            None => Ok(None),
        }
    }

    /// Records another heal attempt and escalates once the ladder runs out
    /// (too many attempts, or the incident is too old).
    ///
    /// # Errors
    ///
    /// Returns an error when the incident is unknown or storage fails.
    pub fn increment_heal_attempts(
        &self,
        id: &str,
        result: &InvariantResult,
    ) -> IncidentResult<()> {
        let Some(mut incident) = self.storage.incident_by_id(id)? else {
            return Err(IncidentError::NotFound { id: id.to_string() });
        };
        if incident.status.is_terminal() {
            return Ok(());
        }
        let now = self.clock.now_ms();
        incident.auto_heal_attempts += 1;
        if incident.status.can_transition_to(IncidentStatus::AutoHealing) {
            incident.status = IncidentStatus::AutoHealing;
        }
        merge_detail(
            &mut incident.details,
            "latest_violation_count",
            json!(result.violation_count()),
        );
        incident.updated_at = now;
        self.storage.update_incident(&incident)?;
        self.registry.increment("incidents.heal_attempts");

        if should_escalate(incident.auto_heal_attempts, now - incident.created_at) {
            self.escalate(
                id,
                &format!(
                    "auto-heal exhausted after {} attempts",
                    incident.auto_heal_attempts
                ),
            )?;
        }
        Ok(())
    }

    /// Escalates an incident. Idempotent: the first call wins; repeats and
    /// terminal states are no-ops. Never downgrades.
    ///
    /// # Errors
    ///
    /// Returns an error when the incident is unknown or storage fails.
    pub fn escalate(&self, id: &str, reason: &str) -> IncidentResult<()> {
        let Some(mut incident) = self.storage.incident_by_id(id)? else {
            return Err(IncidentError::NotFound { id: id.to_string() });
        };
        if !incident.status.can_transition_to(IncidentStatus::Escalated) {
            return Ok(());
        }
        let now = self.clock.now_ms();
        incident.status = IncidentStatus::Escalated;
        incident.escalated_at = Some(now);
        incident.updated_at = now;
        merge_detail(&mut incident.details, "escalation_reason", json!(reason));
        self.storage.update_incident(&incident)?;
        self.registry.increment("incidents.escalated");
        error!(incident = %id, reason, "incident escalated");
        self.alerts.send(Alert::new(
            aegis_core::metrics::Severity::Critical,
            format!("Incident escalated: {}", incident.title),
            format!("Incident {id} escalated: {reason}"),
        ));
        Ok(())
    }

    /// Resolves an incident as auto-healed. No-op on terminal states.
    ///
    /// # Errors
    ///
    /// Returns an error when the incident is unknown or storage fails.
    pub fn auto_resolve(&self, id: &str, reason: &str) -> IncidentResult<()> {
        let Some(mut incident) = self.storage.incident_by_id(id)? else {
            return Err(IncidentError::NotFound { id: id.to_string() });
        };
        if incident.status.is_terminal() {
            return Ok(());
        }
        let now = self.clock.now_ms();
        incident.status = IncidentStatus::Resolved;
        incident.auto_healed = true;
        incident.resolved_at = Some(now);
        incident.resolved_by = Some("auto-heal".to_string());
        incident.resolved_reason = Some(reason.to_string());
        incident.updated_at = now;
        self.storage.update_incident(&incident)?;
        self.registry.increment("incidents.auto_resolved");
        info!(incident = %id, reason, "incident auto-resolved");
        Ok(())
    }

    /// Open P1 count, for the deployment gate.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn open_p1_count(&self) -> IncidentResult<u32> {
        Ok(self.storage.open_incident_counts()?.p1)
    }

    /// Open-incident summary for dashboards.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn incident_summary(&self) -> IncidentResult<IncidentSummary> {
        Ok(self.storage.open_incident_counts()?.into())
    }

    /// Captures the forensic snapshot attached to every new incident.
    fn forensic_snapshot(&self, now_ms: i64) -> serde_json::Value {
        let negative_stock = self.storage.negative_stock_count();
        let payment_gaps = self.storage.payment_gap_count();
        match (negative_stock, payment_gaps) {
            (Ok(negative_stock), Ok(payment_gaps)) => {
                let activity = self.storage.activity_stats();
                json!({
                    "negative_stock_rows": negative_stock,
                    "payment_gap_sales": payment_gaps,
                    "active_db_connections": activity.active,
                    "heap_used_mb": procinfo::heap_used_mb(),
                    "uptime_seconds": (now_ms - self.started_at_ms) / 1000,
                })
            },
            _ => json!({ "error": "snapshot_failed" }),
        }
    }
}

fn merge_detail(details: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    if let Some(map) = details.as_object_mut() {
        map.insert(key.to_string(), value);
    } else {
        *details = json!({ key: value });
    }
}

#[cfg(test)]
mod tests {
    use aegis_core::invariant::ViolationRecord;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Transports;

    fn manager() -> (IncidentManager, Storage, Arc<ManualClock>) {
        let storage = Storage::open_in_memory().expect("storage");
        let registry = Arc::new(MetricsRegistry::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (alerts, _worker) = AlertDispatcher::new(Transports::default(), Arc::clone(&registry));
        let manager = IncidentManager::new(
            storage.clone(),
            alerts,
            Arc::clone(&clock) as SharedClock,
            registry,
        );
        (manager, storage, clock)
    }

    fn failing_result(name: &str, count: usize) -> InvariantResult {
        let violations = (0..count)
            .map(|i| ViolationRecord::new(format!("e{i}"), "entity", json!({})))
            .collect();
        InvariantResult::from_check(name, IncidentPriority::P1, violations, false)
    }

    fn passing_result(name: &str, auto_corrected: bool) -> InvariantResult {
        InvariantResult::from_check(name, IncidentPriority::P3, vec![], auto_corrected)
    }

    #[test]
    fn create_incident_captures_forensics_without_business_tables() {
        let (manager, storage, _clock) = manager();
        let id = manager
            .create_incident(IncidentSpec {
                priority: IncidentPriority::P1,
                title: "manual".to_string(),
                invariant: None,
                details: json!({}),
            })
            .expect("create");
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        // No business tables in this store: the snapshot records its failure.
        assert_eq!(row.forensic["error"], "snapshot_failed");
        assert_eq!(row.status, IncidentStatus::Open);
    }

    #[test]
    fn failing_result_opens_one_incident_then_climbs_the_ladder() {
        let (manager, storage, _clock) = manager();
        let id = manager
            .create_or_update_from_invariant(&failing_result("NO_NEGATIVE_STOCK", 2))
            .expect("fold")
            .expect("created");
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        assert_eq!(row.title, "Invariant violation: NO_NEGATIVE_STOCK");
        assert_eq!(row.status, IncidentStatus::Open);

        // A recurring violation moves to AUTO_HEALING rather than opening a
        // second incident.
        let again = manager
            .create_or_update_from_invariant(&failing_result("NO_NEGATIVE_STOCK", 2))
            .expect("fold")
            .expect("existing");
        assert_eq!(again, id);
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        assert_eq!(row.status, IncidentStatus::AutoHealing);
        assert_eq!(row.auto_heal_attempts, 1);
        assert_eq!(row.details["latest_violation_count"], 2);
    }

    #[test]
    fn third_heal_attempt_escalates() {
        let (manager, storage, _clock) = manager();
        let id = manager
            .create_or_update_from_invariant(&failing_result("NO_NEGATIVE_STOCK", 1))
            .expect("fold")
            .expect("created");
        for _ in 0..3 {
            manager
                .create_or_update_from_invariant(&failing_result("NO_NEGATIVE_STOCK", 1))
                .expect("fold");
        }
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        assert_eq!(row.status, IncidentStatus::Escalated);
        assert!(row.escalated_at.is_some());
    }

    #[test]
    fn stale_incident_escalates_by_age() {
        let (manager, storage, clock) = manager();
        let id = manager
            .create_or_update_from_invariant(&failing_result("NO_DUPLICATE_INVOICES", 1))
            .expect("fold")
            .expect("created");
        clock.advance_ms(16 * 60 * 1000);
        manager
            .create_or_update_from_invariant(&failing_result("NO_DUPLICATE_INVOICES", 1))
            .expect("fold");
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        assert_eq!(row.status, IncidentStatus::Escalated);
    }

    #[test]
    fn escalate_is_idempotent() {
        let (manager, storage, clock) = manager();
        let id = manager
            .create_incident(IncidentSpec {
                priority: IncidentPriority::P1,
                title: "x".to_string(),
                invariant: None,
                details: json!({}),
            })
            .expect("create");
        manager.escalate(&id, "first").expect("escalate");
        let first = storage
            .incident_by_id(&id)
            .expect("query")
            .expect("row")
            .escalated_at;
        clock.advance_ms(5_000);
        manager.escalate(&id, "second").expect("escalate");
        let second = storage
            .incident_by_id(&id)
            .expect("query")
            .expect("row")
            .escalated_at;
        // The first timestamp wins.
        assert_eq!(first, second);
    }

    #[test]
    fn passing_result_resolves_the_active_incident() {
        let (manager, storage, _clock) = manager();
        let id = manager
            .create_or_update_from_invariant(&failing_result("NO_ORPHANED_SALE_ITEMS", 1))
            .expect("fold")
            .expect("created");
        manager
            .create_or_update_from_invariant(&passing_result("NO_ORPHANED_SALE_ITEMS", true))
            .expect("fold");
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        assert_eq!(row.status, IncidentStatus::Resolved);
        assert!(row.auto_healed);
        assert_eq!(
            row.resolved_reason.as_deref(),
            Some("violations auto-corrected")
        );
    }

    #[test]
    fn auto_resolve_skips_terminal_incidents() {
        let (manager, storage, _clock) = manager();
        let id = manager
            .create_incident(IncidentSpec {
                priority: IncidentPriority::P2,
                title: "x".to_string(),
                invariant: None,
                details: json!({}),
            })
            .expect("create");
        manager.auto_resolve(&id, "first").expect("resolve");
        manager.auto_resolve(&id, "second").expect("resolve");
        let row = storage.incident_by_id(&id).expect("query").expect("row");
        assert_eq!(row.resolved_reason.as_deref(), Some("first"));
    }

    #[test]
    fn passing_result_without_incident_is_a_no_op() {
        let (manager, _storage, _clock) = manager();
        let outcome = manager
            .create_or_update_from_invariant(&passing_result("NO_NEGATIVE_STOCK", false))
            .expect("fold");
        assert!(outcome.is_none());
    }

    #[test]
    fn summary_counts_by_priority() {
        let (manager, _storage, _clock) = manager();
        manager
            .create_incident(IncidentSpec {
                priority: IncidentPriority::P1,
                title: "a".to_string(),
                invariant: None,
                details: json!({}),
            })
            .expect("create");
        manager
            .create_incident(IncidentSpec {
                priority: IncidentPriority::P3,
                title: "b".to_string(),
                invariant: None,
                details: json!({}),
            })
            .expect("create");
        let summary = manager.incident_summary().expect("summary");
        assert_eq!(summary.p1_open, 1);
        assert_eq!(summary.p3_open, 1);
        assert_eq!(summary.total_open, 2);
        assert_eq!(manager.open_p1_count().expect("count"), 1);
    }
}
