//! Security engine: anomaly scans, persistent blocks, audit verification.
//!
//! The engine owns the in-process defenses (sliding rate limiter,
//! brute-force detector) consulted by the middleware, runs the periodic
//! SQL-backed pattern scans, persists blocks and security events, and
//! verifies the tamper-evident audit chain.
//!
//! Scan findings are advisory-by-default: each detector logs, records a
//! security event, and only the configured reactions (auto-block, P2
//! incident) touch wider state. A detector whose query fails is logged and
//! skipped; one broken business table must not silence the others.

use std::sync::Arc;

use aegis_core::audit::ChainVerification;
use aegis_core::bruteforce::{BruteForceConfig, BruteForceDetector};
use aegis_core::incident::IncidentPriority;
use aegis_core::metrics::{MetricsRegistry, Severity};
use aegis_core::ratelimit::{RateLimitConfig, SlidingWindowLimiter};
use serde_json::json;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::incidents::{IncidentManager, IncidentSpec};
use crate::storage::{Storage, StorageResult};

/// Incident marker used to dedupe tamper incidents between scans.
pub const AUDIT_TAMPER_INCIDENT: &str = "AUDIT_LOG_TAMPER_DETECTED";

/// Tunables for the pattern scans.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Sale total (minor units) at or above which a confirmed sale is
    /// flagged.
    pub large_transaction_threshold: i64,
    /// Window scanned for large transactions, in milliseconds.
    pub large_transaction_window_ms: i64,
    /// Confirmed sales per user inside the rapid-fire window before
    /// flagging.
    pub rapid_fire_max_sales: u32,
    /// Rapid-fire observation window, in milliseconds.
    pub rapid_fire_window_ms: i64,
    /// How long a rapid-fire user stays blocked, in milliseconds.
    pub rapid_fire_block_ms: i64,
    /// Minimum confirmed sales before the void ratio is meaningful.
    pub void_spike_min_confirmed: u32,
    /// Voided fraction above which a shop is flagged.
    pub void_spike_fraction: f64,
    /// Void-spike observation window, in milliseconds.
    pub void_spike_window_ms: i64,
    /// Audit entries verified per pass.
    pub audit_verify_limit: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            large_transaction_threshold: 1_000_000,
            large_transaction_window_ms: 24 * 60 * 60 * 1000,
            rapid_fire_max_sales: 20,
            rapid_fire_window_ms: 5 * 60 * 1000,
            rapid_fire_block_ms: 60 * 60 * 1000,
            void_spike_min_confirmed: 5,
            void_spike_fraction: 0.10,
            void_spike_window_ms: 60 * 60 * 1000,
            audit_verify_limit: 1000,
        }
    }
}

/// Outcome of one pattern scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOutcome {
    /// Large transactions flagged.
    pub large_transactions: u32,
    /// Users auto-blocked for rapid-fire sales.
    pub rapid_fire_users: u32,
    /// Shops flagged for void spikes.
    pub void_spikes: u32,
    /// Detector queries that failed.
    pub detector_errors: u32,
}

/// The security engine.
pub struct SecurityEngine {
    storage: Storage,
    incidents: Arc<IncidentManager>,
    alerts: AlertDispatcher,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    config: SecurityConfig,
    rate_limiter: Arc<SlidingWindowLimiter>,
    brute_force: Arc<BruteForceDetector>,
}

impl SecurityEngine {
    /// Creates the engine with the given rate-limit ceiling.
    #[must_use]
    pub fn new(
        storage: Storage,
        incidents: Arc<IncidentManager>,
        alerts: AlertDispatcher,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        config: SecurityConfig,
        rate_limit_per_minute: u32,
    ) -> Self {
        let rate_limiter = Arc::new(SlidingWindowLimiter::new(RateLimitConfig {
            limit: rate_limit_per_minute,
            ..RateLimitConfig::default()
        }));
        let brute_force = Arc::new(BruteForceDetector::new(BruteForceConfig::default()));
        Self {
            storage,
            incidents,
            alerts,
            clock,
            registry,
            config,
            rate_limiter,
            brute_force,
        }
    }

    /// In-process request rate limiter, shared with the middleware.
    #[must_use]
    pub fn rate_limiter(&self) -> Arc<SlidingWindowLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    /// In-process brute-force detector, shared with the auth layer.
    #[must_use]
    pub fn brute_force(&self) -> Arc<BruteForceDetector> {
        Arc::clone(&self.brute_force)
    }

    /// Whether `target` (an IP or a user id) has an effective persistent
    /// block.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn is_blocked(&self, target: &str) -> StorageResult<bool> {
        self.storage.is_blocked(target, self.clock.now_ms())
    }

    /// Records a rate-limit rejection as a security event.
    pub fn record_rate_limit_rejection(&self, ip: &str) {
        let now = self.clock.now_ms();
        if let Err(err) = self.storage.insert_security_event(
            "RATE_LIMIT_EXCEEDED",
            Some(ip),
            None,
            &json!({}),
            "MEDIUM",
            false,
            now,
        ) {
            warn!(error = %err, "failed to record rate-limit event");
        }
        self.registry.increment("security.rate_limited");
    }

    /// Records a persistent-block rejection as a security event.
    pub fn record_block_rejection(&self, ip: Option<&str>, user_id: Option<&str>) {
        let now = self.clock.now_ms();
        if let Err(err) = self.storage.insert_security_event(
            "BLOCKED_REQUEST",
            ip,
            user_id,
            &json!({}),
            "MEDIUM",
            false,
            now,
        ) {
            warn!(error = %err, "failed to record block event");
        }
        self.registry.increment("security.blocked_requests");
    }

    /// Runs the three pattern scans.
    ///
    /// # Errors
    ///
    /// Returns an error only when persisting an event or block fails;
    /// detector query failures are counted and skipped.
    pub fn run_scan(&self) -> StorageResult<ScanOutcome> {
        let now = self.clock.now_ms();
        let mut outcome = ScanOutcome::default();

        match self.storage.large_transactions(
            self.config.large_transaction_threshold,
            now - self.config.large_transaction_window_ms,
        ) {
            Ok(rows) => {
                for (sale_id, shop_id, total) in rows {
                    self.storage.insert_security_event(
                        "LARGE_TRANSACTION",
                        None,
                        None,
                        &json!({ "sale_id": sale_id, "shop_id": shop_id, "total": total }),
                        "MEDIUM",
                        false,
                        now,
                    )?;
                    outcome.large_transactions += 1;
                }
            },
            Err(err) => {
                warn!(error = %err, "large-transaction scan failed");
                outcome.detector_errors += 1;
            },
        }

        match self.storage.rapid_fire_users(
            self.config.rapid_fire_max_sales,
            now - self.config.rapid_fire_window_ms,
        ) {
            Ok(rows) => {
                for (user_id, sales) in rows {
                    self.storage.upsert_block(
                        &user_id,
                        "user_id",
                        "rapid-fire sales",
                        now,
                        now + self.config.rapid_fire_block_ms,
                    )?;
                    self.storage.insert_security_event(
                        "RAPID_FIRE_SALES",
                        None,
                        Some(&user_id),
                        &json!({ "sales_in_window": sales }),
                        "HIGH",
                        true,
                        now,
                    )?;
                    warn!(user_id, sales, "rapid-fire user auto-blocked");
                    outcome.rapid_fire_users += 1;
                }
            },
            Err(err) => {
                warn!(error = %err, "rapid-fire scan failed");
                outcome.detector_errors += 1;
            },
        }

        match self.storage.void_spike_shops(
            self.config.void_spike_min_confirmed,
            self.config.void_spike_fraction,
            now - self.config.void_spike_window_ms,
        ) {
            Ok(rows) => {
                for (shop_id, confirmed, voided) in rows {
                    self.storage.insert_security_event(
                        "VOID_SPIKE",
                        None,
                        None,
                        &json!({ "shop_id": shop_id, "confirmed": confirmed, "voided": voided }),
                        "HIGH",
                        false,
                        now,
                    )?;
                    if let Err(err) = self.incidents.create_incident(IncidentSpec {
                        priority: IncidentPriority::P2,
                        title: format!("Void spike in shop {shop_id}"),
                        invariant: None,
                        details: json!({
                            "shop_id": shop_id,
                            "confirmed": confirmed,
                            "voided": voided,
                        }),
                    }) {
                        error!(error = %err, "failed to open void-spike incident");
                    }
                    outcome.void_spikes += 1;
                }
            },
            Err(err) => {
                warn!(error = %err, "void-spike scan failed");
                outcome.detector_errors += 1;
            },
        }

        self.registry.increment("security.scans");
        info!(
            large = outcome.large_transactions,
            rapid = outcome.rapid_fire_users,
            voids = outcome.void_spikes,
            errors = outcome.detector_errors,
            "security scan complete"
        );
        Ok(outcome)
    }

    /// Verifies continuity of a bounded audit-chain prefix. The first break
    /// opens a P1 incident carrying the broken id and both hashes.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn verify_audit_chain(&self) -> StorageResult<ChainVerification> {
        let entries = self.storage.audit_prefix(self.config.audit_verify_limit)?;
        let verification = aegis_core::audit::verify_chain(&entries);
        self.registry.set_gauge(
            "security.audit_chain_valid",
            if verification.valid { 1.0 } else { 0.0 },
        );

        if !verification.valid {
            error!(
                broken_at = verification.broken_at.as_deref().unwrap_or("?"),
                "audit chain tamper detected"
            );
            // One active tamper incident at a time; repeats update nothing.
            let already_open = self
                .storage
                .active_incident_for_invariant(AUDIT_TAMPER_INCIDENT)?
                .is_some();
            if !already_open {
                if let Err(err) = self.incidents.create_incident(IncidentSpec {
                    priority: IncidentPriority::P1,
                    title: AUDIT_TAMPER_INCIDENT.to_string(),
                    invariant: Some(AUDIT_TAMPER_INCIDENT.to_string()),
                    details: json!({
                        "broken_at": verification.broken_at,
                        "expected_prev_hash": verification.expected,
                        "actual_prev_hash": verification.actual,
                    }),
                }) {
                    error!(error = %err, "failed to open tamper incident");
                }
            }
            self.alerts.send(Alert::new(
                Severity::Critical,
                "Audit chain tamper detected",
                format!(
                    "chain broken at {}",
                    verification.broken_at.as_deref().unwrap_or("?")
                ),
            ));
        }
        Ok(verification)
    }

    /// Scheduler hook: drops idle limiter windows and stale brute-force
    /// entries.
    pub fn cleanup_windows(&self) {
        let now = self.clock.now_ms();
        let dropped = self.rate_limiter.cleanup(now);
        self.brute_force.cleanup(now);
        self.registry
            .increment_by("security.windows_cleaned", dropped as u64);
    }
}
