//! End-to-end flows across the engines, against a real file-backed store.

mod common;

use aegis_core::incident::{IncidentPriority, IncidentStatus};
use aegis_core::scoring::HealthGrade;
use aegis_daemon::alert::AlertDispatcher;
use aegis_daemon::clock::SharedClock;
use aegis_daemon::config::Transports;
use aegis_daemon::gates::{DeploymentGateRunner, GateConfig, GateError, GATE_NO_OPEN_P1};
use aegis_daemon::storage::BackupValidationRow;
use common::ControlPlane;
use serde_json::json;
use std::sync::Arc;

/// A seeded negative-stock row flows through the whole pipeline: one
/// violation, one P1 incident, drift 92, integrity component 28.
#[tokio::test(flavor = "multi_thread")]
async fn negative_stock_creates_incident_and_scores() {
    let plane = ControlPlane::new(100);
    plane.create_business_tables();
    plane
        .seed_connection()
        .execute_batch(
            "INSERT INTO stock_items (id, shop_id, quantity) VALUES ('st1', 'shop1', -3);
             INSERT INTO stock_movements (id, stock_item_id, delta) VALUES ('m1', 'st1', -3);",
        )
        .expect("seed");

    let outcome = plane.invariants.run_cycle().expect("cycle");
    assert_eq!(outcome.drift_score, 92);

    let violations = plane
        .storage
        .violation_count_since("NO_NEGATIVE_STOCK", 0)
        .expect("count");
    assert_eq!(violations, 1);

    let open = plane.storage.open_incidents(50).expect("open");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].priority, IncidentPriority::P1);
    assert_eq!(open[0].title, "Invariant violation: NO_NEGATIVE_STOCK");
    assert_eq!(open[0].status, IncidentStatus::Open);
    // Forensics captured the offending row count.
    assert_eq!(open[0].forensic["negative_stock_rows"], 1);

    // Health: integrity scales drift into 30 points; the open P1 deducts
    // from the incident component.
    let report = plane.health.compute().expect("health");
    assert_eq!(report.components.integrity, 28);
    assert_eq!(report.components.incidents, 10);
}

/// Repairing the data lets the next cycle auto-resolve the incident.
#[tokio::test(flavor = "multi_thread")]
async fn repaired_violation_resolves_on_the_next_cycle() {
    let plane = ControlPlane::new(100);
    plane.create_business_tables();
    plane
        .seed_connection()
        .execute_batch(
            "INSERT INTO stock_items (id, shop_id, quantity) VALUES ('st1', 'shop1', -3);
             INSERT INTO stock_movements (id, stock_item_id, delta) VALUES ('m1', 'st1', -3);",
        )
        .expect("seed");
    plane.invariants.run_cycle().expect("cycle");
    assert_eq!(plane.storage.open_incident_counts().expect("counts").p1, 1);

    plane
        .seed_connection()
        .execute_batch("UPDATE stock_items SET quantity = 0 WHERE id = 'st1'; \
                        UPDATE stock_movements SET delta = 0 WHERE id = 'm1';")
        .expect("repair");
    plane.invariants.run_cycle().expect("cycle");

    let counts = plane.storage.open_incident_counts().expect("counts");
    assert_eq!(counts.total(), 0);
    assert_eq!(
        plane
            .storage
            .latest_drift_score()
            .expect("drift")
            .expect("sample")
            .0,
        100
    );
}

/// One open P1 blocks the deploy; the run row and the
/// blocker list are persisted; nothing else changes.
#[tokio::test(flavor = "multi_thread")]
async fn open_p1_blocks_deployment_gates() {
    let plane = ControlPlane::new(100);
    plane.create_business_tables();

    // Healthy prerequisites.
    plane
        .storage
        .insert_drift_score(95, &json!({}), common::START_MS - 1_000)
        .expect("drift");
    plane
        .storage
        .insert_backup_validation(&BackupValidationRow {
            id: "b1".to_string(),
            backup_file: "dump.db".to_string(),
            size_kb: 10,
            checksum: None,
            restore_tested: false,
            drift_clean: true,
            incident_id: None,
            validated_at: common::START_MS - 2_000,
            status: "PASSED".to_string(),
        })
        .expect("backup");

    // One open P1.
    plane
        .incidents
        .create_incident(aegis_daemon::incidents::IncidentSpec {
            priority: IncidentPriority::P1,
            title: "manual P1".to_string(),
            invariant: None,
            details: json!({}),
        })
        .expect("incident");

    let (alerts, _worker) =
        AlertDispatcher::new(Transports::default(), Arc::clone(&plane.registry));
    let runner = DeploymentGateRunner::new(
        plane.storage.clone(),
        alerts,
        Arc::clone(&plane.clock) as SharedClock,
        Arc::clone(&plane.registry),
        GateConfig {
            skip_coverage: true,
            ..GateConfig::default()
        },
    );
    let Err(GateError::Blocked { blockers, .. }) = runner.run(Some("release-42")).await else {
        panic!("expected blocked deploy");
    };
    assert_eq!(blockers, vec![GATE_NO_OPEN_P1.to_string()]);

    // Resolving the incident unblocks the next run.
    let open = plane.storage.open_incidents(1).expect("open");
    plane
        .incidents
        .auto_resolve(&open[0].id, "fixed")
        .expect("resolve");
    let outcome = runner.run(Some("release-42")).await.expect("second run");
    assert!(outcome.passed);
}

/// Three chained entries, the middle one's prev_hash
/// rewritten, verification locates the break and opens a P1.
#[tokio::test(flavor = "multi_thread")]
async fn audit_tamper_is_detected_end_to_end() {
    let plane = ControlPlane::new(100);
    let _a = plane
        .storage
        .append_audit("sale.confirm", "sale", "s1", common::START_MS)
        .expect("append");
    let b = plane
        .storage
        .append_audit("sale.confirm", "sale", "s2", common::START_MS + 1)
        .expect("append");
    let _c = plane
        .storage
        .append_audit("sale.void", "sale", "s1", common::START_MS + 2)
        .expect("append");

    plane
        .seed_connection()
        .execute(
            "UPDATE audit_log SET prev_hash = 'ffff' WHERE id = ?1",
            rusqlite::params![b.id],
        )
        .expect("tamper");

    let verification = plane.security.verify_audit_chain().expect("verify");
    assert!(!verification.valid);
    assert_eq!(verification.broken_at.as_deref(), Some(b.id.as_str()));

    let open = plane.storage.open_incidents(10).expect("open");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].priority, IncidentPriority::P1);
    assert_eq!(open[0].title, "AUDIT_LOG_TAMPER_DETECTED");
    assert_eq!(open[0].details["broken_at"], b.id.as_str());
    assert_eq!(open[0].details["actual_prev_hash"], "ffff");
}

/// A wrecked system scores F and engages safe
/// mode with the auto-engage reason.
#[tokio::test(flavor = "multi_thread")]
async fn grade_f_engages_safe_mode() {
    let plane = ControlPlane::new(100);
    for i in 0..3 {
        plane
            .incidents
            .create_incident(aegis_daemon::incidents::IncidentSpec {
                priority: IncidentPriority::P1,
                title: format!("P1 {i}"),
                invariant: None,
                details: json!({}),
            })
            .expect("incident");
    }
    plane.registry.set_gauge("http.error_rate", 8.0);
    for _ in 0..200 {
        plane.registry.record("http.request_duration_ms", 1200.0);
    }
    plane
        .storage
        .insert_drift_score(0, &json!({}), common::START_MS - 10)
        .expect("drift");

    let report = plane.health.compute().expect("health");
    assert_eq!(report.score, 5);
    assert_eq!(report.grade, HealthGrade::F);
    assert!(report.safe_mode);

    let state = plane.storage.safe_mode_state().expect("state");
    assert!(state.reason.expect("reason").starts_with("Health score F"));
}
