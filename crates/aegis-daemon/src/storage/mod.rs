//! SQLite-backed store for the control plane.
//!
//! The control plane persists its own entities (incidents, violations,
//! score samples, blocks, the audit log, idempotency records) in the same
//! transactional store as the business tables, and reads the business
//! tables for integrity checks. Each entity family is mutated by exactly
//! one component; this module only provides the typed repository methods.
//!
//! The connection runs in WAL mode and is shared behind a mutex. Every
//! access goes through [`Storage::with_conn`], which also feeds two soft
//! observability surfaces consumed by the performance engine:
//!
//! - per-statement timing aggregates (calls, mean time), the store's
//!   statement-level statistics view
//! - an activity snapshot (in-flight holders vs. the configured ceiling)
//!   for pool-saturation estimation
//!
//! Business tables are owned by the application layer; the integrity
//! queries here treat them as read-only (the single exception is the
//! orphaned-sale-item repair, which deletes rows the application can no
//! longer reach).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use aegis_core::audit::{self, AuditEntry};
use aegis_core::incident::{IncidentPriority, IncidentStatus};
use aegis_core::invariant::ViolationRecord;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Migration versions this build expects to be applied.
const EXPECTED_MIGRATIONS: &[&str] = &["0001_control_plane"];

/// Virtual connection ceiling used for saturation estimation. The store
/// multiplexes one WAL connection; the ceiling bounds how many concurrent
/// holders count as "full".
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Monetary tolerance (in minor units) for reconciliation checks.
const AMOUNT_TOLERANCE: i64 = 1;

/// Errors surfaced by storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during open.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of an opaque map failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Row types
// =============================================================================

/// One incident row.
#[derive(Debug, Clone)]
pub struct IncidentRow {
    /// Incident id.
    pub id: String,
    /// Priority band.
    pub priority: IncidentPriority,
    /// Lifecycle status.
    pub status: IncidentStatus,
    /// Human-readable title.
    pub title: String,
    /// Invariant name, when the incident tracks one.
    pub invariant: Option<String>,
    /// Opaque diagnostic map.
    pub details: serde_json::Value,
    /// Forensic snapshot captured at creation.
    pub forensic: serde_json::Value,
    /// Auto-heal attempts so far.
    pub auto_heal_attempts: u32,
    /// Whether auto-healing resolved it.
    pub auto_healed: bool,
    /// Creation time (unix ms).
    pub created_at: i64,
    /// Last mutation time (unix ms).
    pub updated_at: i64,
    /// Resolution time, if resolved.
    pub resolved_at: Option<i64>,
    /// Escalation time, if escalated.
    pub escalated_at: Option<i64>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Why it resolved.
    pub resolved_reason: Option<String>,
}

/// The safe-mode singleton row.
#[derive(Debug, Clone)]
pub struct SafeModeState {
    /// Whether safe mode is engaged.
    pub safe_mode: bool,
    /// Why it engaged.
    pub reason: Option<String>,
    /// When it engaged (unix ms).
    pub enabled_at: Option<i64>,
    /// Who engaged it.
    pub enabled_by: Option<String>,
    /// Token required to disable.
    pub override_token: Option<String>,
    /// Last mutation time (unix ms).
    pub updated_at: i64,
}

/// One idempotency record.
#[derive(Debug, Clone)]
pub struct IdempotencyRow {
    /// Client-supplied key.
    pub id: String,
    /// Stored response body (absent while locked).
    pub response_body: Option<serde_json::Value>,
    /// Stored status code.
    pub status_code: Option<u16>,
    /// Whether a caller is currently executing.
    pub locked: bool,
    /// When the lock was taken.
    pub locked_at: Option<i64>,
    /// Creation time.
    pub created_at: i64,
    /// Expiry time.
    pub expires_at: i64,
}

/// One backup validation row.
#[derive(Debug, Clone)]
pub struct BackupValidationRow {
    /// Validation id.
    pub id: String,
    /// Validated dump file.
    pub backup_file: String,
    /// Dump size in KiB.
    pub size_kb: u64,
    /// SHA-256 of the dump.
    pub checksum: Option<String>,
    /// Whether a restore test ran.
    pub restore_tested: bool,
    /// Whether the drift score was clean at validation time.
    pub drift_clean: bool,
    /// Incident opened on failure.
    pub incident_id: Option<String>,
    /// Validation time.
    pub validated_at: i64,
    /// PENDING, PASSED, or FAILED.
    pub status: String,
}

/// Per-statement timing aggregate.
#[derive(Debug, Clone)]
pub struct StatementStat {
    /// Statement tag.
    pub query: String,
    /// Executions recorded.
    pub calls: u64,
    /// Mean execution time in milliseconds.
    pub mean_ms: f64,
    /// Total execution time in milliseconds.
    pub total_ms: f64,
}

/// Table access statistics for index advisories. The SQLite build has no
/// scan counters, so this is populated only when the underlying store
/// exposes them; the analysis path is exercised with injected data.
#[derive(Debug, Clone)]
pub struct TableAccessStat {
    /// Table name.
    pub table: String,
    /// Sequential scans observed.
    pub seq_scans: u64,
    /// Tuples read by sequential scans.
    pub seq_tuples_read: u64,
    /// Index scans observed.
    pub index_scans: u64,
}

/// Connection activity snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ActivityStats {
    /// Holders currently executing or waiting on the connection.
    pub active: u32,
    /// Idle open connections.
    pub idle: u32,
    /// Configured connection ceiling.
    pub max_connections: u32,
}

impl ActivityStats {
    /// Saturation percentage `(active + idle) / max`.
    #[must_use]
    pub fn saturation_pct(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        f64::from(self.active + self.idle) / f64::from(self.max_connections) * 100.0
    }
}

/// Open-incident counts per priority band.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenIncidentCounts {
    /// Open P1 incidents.
    pub p1: u32,
    /// Open P2 incidents.
    pub p2: u32,
    /// Open P3 incidents.
    pub p3: u32,
    /// Open P4 incidents.
    pub p4: u32,
}

impl OpenIncidentCounts {
    /// Total open incidents.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.p1 + self.p2 + self.p3 + self.p4
    }
}

#[derive(Debug, Default)]
struct StatementTimings {
    calls: u64,
    total_ms: f64,
}

// =============================================================================
// Storage
// =============================================================================

/// Shared store handle.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    statement_stats: Arc<RwLock<HashMap<String, StatementTimings>>>,
    in_flight: Arc<AtomicU32>,
    max_connections: u32,
}

impl Storage {
    /// Opens (or creates) the store at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema fails
    /// to apply.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the schema fails to apply.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000_i64)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        for version in EXPECTED_MIGRATIONS {
            conn.execute(
                "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, 0_i64],
            )?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            statement_stats: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(AtomicU32::new(0)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// Runs `f` against the connection, recording statement timing under
    /// `tag` and tracking activity for saturation estimation.
    fn with_conn<T>(
        &self,
        tag: &str,
        f: impl FnOnce(&MutexGuard<'_, Connection>) -> Result<T, rusqlite::Error>,
    ) -> StorageResult<T> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = {
            let guard = self.conn.lock().expect("storage mutex poisoned");
            f(&guard)
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut stats = self
            .statement_stats
            .write()
            .expect("statement stats lock poisoned");
        let entry = stats.entry(tag.to_string()).or_default();
        entry.calls += 1;
        entry.total_ms += elapsed_ms;
        drop(stats);

        result.map_err(StorageError::from)
    }

    /// Per-statement timing aggregates recorded so far.
    #[must_use]
    pub fn statement_stats(&self) -> Vec<StatementStat> {
        let stats = self
            .statement_stats
            .read()
            .expect("statement stats lock poisoned");
        stats
            .iter()
            .map(|(query, timings)| {
                #[allow(clippy::cast_precision_loss)]
                let mean_ms = if timings.calls == 0 {
                    0.0
                } else {
                    timings.total_ms / timings.calls as f64
                };
                StatementStat {
                    query: query.clone(),
                    calls: timings.calls,
                    mean_ms,
                    total_ms: timings.total_ms,
                }
            })
            .collect()
    }

    /// Table access statistics, when the store exposes them. The SQLite
    /// build answers empty.
    #[must_use]
    pub fn table_access_stats(&self) -> Vec<TableAccessStat> {
        Vec::new()
    }

    /// Current connection activity.
    #[must_use]
    pub fn activity_stats(&self) -> ActivityStats {
        let active = self.in_flight.load(Ordering::SeqCst);
        ActivityStats {
            active,
            idle: u32::from(active == 0),
            max_connections: self.max_connections,
        }
    }

    /// Count of expected migrations not yet applied.
    ///
    /// # Errors
    ///
    /// Returns an error when the bookkeeping table cannot be read.
    pub fn pending_migrations(&self) -> StorageResult<u32> {
        self.with_conn("schema_migrations.pending", |conn| {
            let mut pending = 0;
            for version in EXPECTED_MIGRATIONS {
                let applied: Option<String> = conn
                    .query_row(
                        "SELECT version FROM schema_migrations WHERE version = ?1",
                        params![version],
                        |row| row.get(0),
                    )
                    .optional()?;
                if applied.is_none() {
                    pending += 1;
                }
            }
            Ok(pending)
        })
    }

    // =========================================================================
    // Incidents
    // =========================================================================

    /// Inserts a new incident row.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    pub fn insert_incident(&self, row: &IncidentRow) -> StorageResult<()> {
        let details = serde_json::to_string(&row.details)?;
        let forensic = serde_json::to_string(&row.forensic)?;
        self.with_conn("incidents.insert", |conn| {
            conn.execute(
                "INSERT INTO incidents (id, priority, status, title, invariant, details, \
                 forensic, auto_heal_attempts, auto_healed, created_at, updated_at, \
                 resolved_at, escalated_at, resolved_by, resolved_reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    row.id,
                    row.priority.as_str(),
                    row.status.as_str(),
                    row.title,
                    row.invariant,
                    details,
                    forensic,
                    row.auto_heal_attempts,
                    row.auto_healed,
                    row.created_at,
                    row.updated_at,
                    row.resolved_at,
                    row.escalated_at,
                    row.resolved_by,
                    row.resolved_reason,
                ],
            )?;
            Ok(())
        })
    }

    /// Loads one incident by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn incident_by_id(&self, id: &str) -> StorageResult<Option<IncidentRow>> {
        self.with_conn("incidents.by_id", |conn| {
            conn.query_row(
                &format!("{INCIDENT_SELECT} WHERE id = ?1"),
                params![id],
                map_incident_row,
            )
            .optional()
        })
    }

    /// Finds the active (OPEN or AUTO_HEALING) incident tracking an
    /// invariant, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn active_incident_for_invariant(
        &self,
        invariant: &str,
    ) -> StorageResult<Option<IncidentRow>> {
        self.with_conn("incidents.active_for_invariant", |conn| {
            conn.query_row(
                &format!(
                    "{INCIDENT_SELECT} WHERE invariant = ?1 \
                     AND status IN ('OPEN', 'AUTO_HEALING') \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![invariant],
                map_incident_row,
            )
            .optional()
        })
    }

    /// Applies a status transition with accompanying field updates.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn update_incident(&self, row: &IncidentRow) -> StorageResult<()> {
        let details = serde_json::to_string(&row.details)?;
        self.with_conn("incidents.update", |conn| {
            conn.execute(
                "UPDATE incidents SET status = ?2, details = ?3, auto_heal_attempts = ?4, \
                 auto_healed = ?5, updated_at = ?6, resolved_at = ?7, escalated_at = ?8, \
                 resolved_by = ?9, resolved_reason = ?10 WHERE id = ?1",
                params![
                    row.id,
                    row.status.as_str(),
                    details,
                    row.auto_heal_attempts,
                    row.auto_healed,
                    row.updated_at,
                    row.resolved_at,
                    row.escalated_at,
                    row.resolved_by,
                    row.resolved_reason,
                ],
            )?;
            Ok(())
        })
    }

    /// Counts active incidents per priority band.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn open_incident_counts(&self) -> StorageResult<OpenIncidentCounts> {
        self.with_conn("incidents.open_counts", |conn| {
            let mut stmt = conn.prepare(
                "SELECT priority, COUNT(*) FROM incidents \
                 WHERE status IN ('OPEN', 'AUTO_HEALING', 'ESCALATED') GROUP BY priority",
            )?;
            let mut counts = OpenIncidentCounts::default();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (priority, count) = row?;
                match priority.as_str() {
                    "P1" => counts.p1 = count,
                    "P2" => counts.p2 = count,
                    "P3" => counts.p3 = count,
                    "P4" => counts.p4 = count,
                    _ => {},
                }
            }
            Ok(counts)
        })
    }

    /// Active incidents ordered P1→P4, then newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn open_incidents(&self, limit: u32) -> StorageResult<Vec<IncidentRow>> {
        self.with_conn("incidents.open_list", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{INCIDENT_SELECT} WHERE status IN ('OPEN', 'AUTO_HEALING', 'ESCALATED') \
                 ORDER BY priority ASC, created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], map_incident_row)?;
            rows.collect()
        })
    }

    // =========================================================================
    // Invariant violations & drift samples
    // =========================================================================

    /// Appends violation rows, each as its own atomic insert.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    pub fn insert_violations(
        &self,
        invariant: &str,
        violations: &[ViolationRecord],
        auto_corrected: bool,
        incident_id: Option<&str>,
        now_ms: i64,
    ) -> StorageResult<()> {
        for violation in violations {
            let details = serde_json::to_string(&violation.detail)?;
            self.with_conn("invariant_violations.insert", |conn| {
                conn.execute(
                    "INSERT INTO invariant_violations (id, invariant, shop_id, entity_id, \
                     entity_type, details, auto_corrected, incident_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        Uuid::new_v4().to_string(),
                        invariant,
                        violation.shop_id,
                        violation.entity_id,
                        violation.entity_type,
                        details,
                        auto_corrected,
                        incident_id,
                        now_ms,
                    ],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Violations recorded since `since_ms` for one invariant.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn violation_count_since(&self, invariant: &str, since_ms: i64) -> StorageResult<u32> {
        self.with_conn("invariant_violations.count_since", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM invariant_violations \
                 WHERE invariant = ?1 AND created_at >= ?2",
                params![invariant, since_ms],
                |row| row.get(0),
            )
        })
    }

    /// Appends one drift sample.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_drift_score(
        &self,
        score: u8,
        components: &serde_json::Value,
        now_ms: i64,
    ) -> StorageResult<()> {
        let components = serde_json::to_string(components)?;
        self.with_conn("drift_scores.insert", |conn| {
            conn.execute(
                "INSERT INTO drift_scores (id, score, components, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![Uuid::new_v4().to_string(), score, components, now_ms],
            )?;
            Ok(())
        })
    }

    /// Latest drift score, if any cycle has run.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn latest_drift_score(&self) -> StorageResult<Option<(u8, i64)>> {
        self.with_conn("drift_scores.latest", |conn| {
            conn.query_row(
                "SELECT score, created_at FROM drift_scores ORDER BY created_at DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    /// Drift samples since `since_ms`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn drift_scores_since(&self, since_ms: i64) -> StorageResult<Vec<(u8, i64)>> {
        self.with_conn("drift_scores.since", |conn| {
            let mut stmt = conn.prepare(
                "SELECT score, created_at FROM drift_scores \
                 WHERE created_at >= ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![since_ms], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })
    }

    // =========================================================================
    // Health samples & safe mode
    // =========================================================================

    /// Appends one health sample.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_health_score(
        &self,
        score: u8,
        components: &serde_json::Value,
        safe_mode: bool,
        now_ms: i64,
    ) -> StorageResult<()> {
        let components = serde_json::to_string(components)?;
        self.with_conn("health_scores.insert", |conn| {
            conn.execute(
                "INSERT INTO health_scores (id, score, components, safe_mode, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    score,
                    components,
                    safe_mode,
                    now_ms
                ],
            )?;
            Ok(())
        })
    }

    /// Latest health sample, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn latest_health_score(&self) -> StorageResult<Option<(u8, serde_json::Value, i64)>> {
        let row = self.with_conn("health_scores.latest", |conn| {
            conn.query_row(
                "SELECT score, components, recorded_at FROM health_scores \
                 ORDER BY recorded_at DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, u8>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
        })?;
        match row {
            Some((score, components, at)) => {
                let components = serde_json::from_str(&components)?;
                Ok(Some((score, components, at)))
            },
            None => Ok(None),
        }
    }

    /// Reads the safe-mode singleton.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn safe_mode_state(&self) -> StorageResult<SafeModeState> {
        self.with_conn("safe_mode.read", |conn| {
            conn.query_row(
                "SELECT safe_mode, reason, enabled_at, enabled_by, override_token, updated_at \
                 FROM safe_mode_state WHERE id = 1",
                [],
                |row| {
                    Ok(SafeModeState {
                        safe_mode: row.get(0)?,
                        reason: row.get(1)?,
                        enabled_at: row.get(2)?,
                        enabled_by: row.get(3)?,
                        override_token: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
        })
    }

    /// Enables safe mode if it is currently off. Returns `true` when this
    /// call performed the transition.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn enable_safe_mode(
        &self,
        reason: &str,
        enabled_by: &str,
        override_token: &str,
        now_ms: i64,
    ) -> StorageResult<bool> {
        self.with_conn("safe_mode.enable", |conn| {
            let changed = conn.execute(
                "UPDATE safe_mode_state SET safe_mode = 1, reason = ?1, enabled_at = ?2, \
                 enabled_by = ?3, override_token = ?4, updated_at = ?2 \
                 WHERE id = 1 AND safe_mode = 0",
                params![reason, now_ms, enabled_by, override_token],
            )?;
            Ok(changed > 0)
        })
    }

    /// Disables safe mode iff `override_token` matches the stored token.
    /// The comparison and the clear run in the same statement. Returns
    /// `true` on success.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn disable_safe_mode(&self, override_token: &str, now_ms: i64) -> StorageResult<bool> {
        self.with_conn("safe_mode.disable", |conn| {
            let changed = conn.execute(
                "UPDATE safe_mode_state SET safe_mode = 0, reason = NULL, enabled_at = NULL, \
                 enabled_by = NULL, override_token = NULL, updated_at = ?2 \
                 WHERE id = 1 AND safe_mode = 1 AND override_token = ?1",
                params![override_token, now_ms],
            )?;
            Ok(changed > 0)
        })
    }

    // =========================================================================
    // Idempotency records
    // =========================================================================

    /// Finds a live (unexpired) record for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn idempotency_find_live(
        &self,
        key: &str,
        now_ms: i64,
    ) -> StorageResult<Option<IdempotencyRow>> {
        let row = self.with_conn("idempotency.find_live", |conn| {
            conn.query_row(
                "SELECT id, response_body, status_code, locked, locked_at, created_at, \
                 expires_at FROM idempotency_records WHERE id = ?1 AND expires_at > ?2",
                params![key, now_ms],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<u16>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
        })?;
        match row {
            Some((id, body, status_code, locked, locked_at, created_at, expires_at)) => {
                let response_body = body.map(|b| serde_json::from_str(&b)).transpose()?;
                Ok(Some(IdempotencyRow {
                    id,
                    response_body,
                    status_code,
                    locked,
                    locked_at,
                    created_at,
                    expires_at,
                }))
            },
            None => Ok(None),
        }
    }

    /// Attempts to claim `key` with an in-flight lock. Loses quietly when a
    /// concurrent caller inserted first; returns `true` when this call won.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn idempotency_try_lock(&self, key: &str, now_ms: i64, ttl_ms: i64) -> StorageResult<bool> {
        self.with_conn("idempotency.try_lock", |conn| {
            let inserted = conn.execute(
                "INSERT INTO idempotency_records (id, locked, locked_at, created_at, expires_at) \
                 VALUES (?1, 1, ?2, ?2, ?3) ON CONFLICT (id) DO NOTHING",
                params![key, now_ms, now_ms + ttl_ms],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Fills the stored response and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    pub fn idempotency_complete(
        &self,
        key: &str,
        status_code: u16,
        body: &serde_json::Value,
    ) -> StorageResult<()> {
        let body = serde_json::to_string(body)?;
        self.with_conn("idempotency.complete", |conn| {
            conn.execute(
                "UPDATE idempotency_records SET response_body = ?2, status_code = ?3, locked = 0 \
                 WHERE id = ?1",
                params![key, body, status_code],
            )?;
            Ok(())
        })
    }

    /// Frees `key` after a handler failure so a later retry can run.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn idempotency_delete(&self, key: &str) -> StorageResult<()> {
        self.with_conn("idempotency.delete", |conn| {
            conn.execute(
                "DELETE FROM idempotency_records WHERE id = ?1",
                params![key],
            )?;
            Ok(())
        })
    }

    /// Deletes `key` only if its record has expired, clearing the way for a
    /// fresh claim when the periodic GC has not caught up yet.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn idempotency_delete_expired(&self, key: &str, now_ms: i64) -> StorageResult<bool> {
        self.with_conn("idempotency.delete_expired", |conn| {
            let deleted = conn.execute(
                "DELETE FROM idempotency_records WHERE id = ?1 AND expires_at <= ?2",
                params![key, now_ms],
            )?;
            Ok(deleted > 0)
        })
    }

    /// Garbage-collects expired records. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn idempotency_gc(&self, now_ms: i64) -> StorageResult<usize> {
        self.with_conn("idempotency.gc", |conn| {
            conn.execute(
                "DELETE FROM idempotency_records WHERE expires_at < ?1",
                params![now_ms],
            )
        })
    }

    /// Whether any live key with the given prefix was created inside the
    /// window, for duplicate-transaction detection.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn idempotency_prefix_exists(
        &self,
        prefix: &str,
        since_ms: i64,
        now_ms: i64,
    ) -> StorageResult<bool> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.with_conn("idempotency.prefix_exists", |conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM idempotency_records \
                 WHERE id LIKE ?1 ESCAPE '\\' AND created_at >= ?2 AND expires_at > ?3",
                params![pattern, since_ms, now_ms],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // =========================================================================
    // Security events, blocks, audit chain
    // =========================================================================

    /// Appends a security event.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_security_event(
        &self,
        event_type: &str,
        ip: Option<&str>,
        user_id: Option<&str>,
        details: &serde_json::Value,
        severity: &str,
        auto_blocked: bool,
        now_ms: i64,
    ) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        let details = serde_json::to_string(details)?;
        let event_id = id.clone();
        self.with_conn("security_events.insert", move |conn| {
            conn.execute(
                "INSERT INTO security_events (id, event_type, ip, user_id, details, severity, \
                 auto_blocked, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event_id, event_type, ip, user_id, details, severity, auto_blocked, now_ms
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Security event counts by type since `since_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn security_event_counts_since(
        &self,
        since_ms: i64,
    ) -> StorageResult<HashMap<String, u32>> {
        self.with_conn("security_events.counts", |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_type, COUNT(*) FROM security_events \
                 WHERE created_at >= ?1 GROUP BY event_type",
            )?;
            let rows = stmt.query_map(params![since_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            rows.collect()
        })
    }

    /// Upserts a block by target, extending expiry and refreshing the
    /// reason.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn upsert_block(
        &self,
        target: &str,
        target_type: &str,
        reason: &str,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> StorageResult<()> {
        self.with_conn("security_blocks.upsert", |conn| {
            conn.execute(
                "INSERT INTO security_blocks (id, target, target_type, reason, blocked_at, \
                 expires_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (target) DO UPDATE SET reason = excluded.reason, \
                 blocked_at = excluded.blocked_at, expires_at = excluded.expires_at, \
                 lifted_at = NULL, lifted_by = NULL",
                params![
                    Uuid::new_v4().to_string(),
                    target,
                    target_type,
                    reason,
                    now_ms,
                    expires_at_ms
                ],
            )?;
            Ok(())
        })
    }

    /// Whether `target` has an effective (unexpired, unlifted) block.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn is_blocked(&self, target: &str, now_ms: i64) -> StorageResult<bool> {
        self.with_conn("security_blocks.is_blocked", |conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM security_blocks \
                 WHERE target = ?1 AND expires_at > ?2 AND lifted_at IS NULL",
                params![target, now_ms],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Lifts a block manually.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn lift_block(&self, target: &str, lifted_by: &str, now_ms: i64) -> StorageResult<bool> {
        self.with_conn("security_blocks.lift", |conn| {
            let changed = conn.execute(
                "UPDATE security_blocks SET lifted_at = ?2, lifted_by = ?3 \
                 WHERE target = ?1 AND lifted_at IS NULL",
                params![target, now_ms, lifted_by],
            )?;
            Ok(changed > 0)
        })
    }

    /// Appends an audit entry, chaining it to the current tip. The row hash
    /// is computed here, at insertion time.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn append_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        now_ms: i64,
    ) -> StorageResult<AuditEntry> {
        let id = Uuid::new_v4().to_string();
        self.with_conn("audit_log.append", |conn| {
            let prev_hash: String = conn
                .query_row(
                    "SELECT row_hash FROM audit_log ORDER BY created_at DESC, id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or_else(|| audit::GENESIS_HASH.to_string());
            let row_hash =
                audit::compute_row_hash(&prev_hash, &id, action, entity_type, entity_id, now_ms);
            conn.execute(
                "INSERT INTO audit_log (id, action, entity_type, entity_id, row_hash, \
                 prev_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, action, entity_type, entity_id, row_hash, prev_hash, now_ms],
            )?;
            Ok(AuditEntry {
                id: id.clone(),
                action: action.to_string(),
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                row_hash,
                prev_hash,
                created_at_ms: now_ms,
            })
        })
    }

    /// Loads a bounded prefix of the audit chain ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn audit_prefix(&self, limit: u32) -> StorageResult<Vec<AuditEntry>> {
        self.with_conn("audit_log.prefix", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action, entity_type, entity_id, row_hash, prev_hash, created_at \
                 FROM audit_log ORDER BY created_at ASC, id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    entity_type: row.get(2)?,
                    entity_id: row.get(3)?,
                    row_hash: row.get(4)?,
                    prev_hash: row.get(5)?,
                    created_at_ms: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    // =========================================================================
    // Security pattern queries (business tables)
    // =========================================================================

    /// Confirmed sales at or above `threshold` minor units since `since_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure (including absent business
    /// tables).
    pub fn large_transactions(
        &self,
        threshold: i64,
        since_ms: i64,
    ) -> StorageResult<Vec<(String, Option<String>, i64)>> {
        self.with_conn("sales.large_transactions", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, shop_id, total FROM sales \
                 WHERE status = 'CONFIRMED' AND total >= ?1 AND created_at >= ?2",
            )?;
            let rows = stmt.query_map(params![threshold, since_ms], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })
    }

    /// Users with more than `max_sales` confirmed sales since `since_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn rapid_fire_users(
        &self,
        max_sales: u32,
        since_ms: i64,
    ) -> StorageResult<Vec<(String, u32)>> {
        self.with_conn("sales.rapid_fire", |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, COUNT(*) AS sales FROM sales \
                 WHERE status = 'CONFIRMED' AND created_at >= ?1 AND user_id IS NOT NULL \
                 GROUP BY user_id HAVING sales > ?2",
            )?;
            let rows = stmt.query_map(params![since_ms, max_sales], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })
    }

    /// Shops whose voided fraction exceeded `void_fraction` of at least
    /// `min_confirmed` confirmed sales since `since_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn void_spike_shops(
        &self,
        min_confirmed: u32,
        void_fraction: f64,
        since_ms: i64,
    ) -> StorageResult<Vec<(String, u32, u32)>> {
        self.with_conn("sales.void_spike", |conn| {
            let mut stmt = conn.prepare(
                "SELECT shop_id, \
                        SUM(CASE WHEN status = 'CONFIRMED' THEN 1 ELSE 0 END) AS confirmed, \
                        SUM(CASE WHEN status = 'VOIDED' THEN 1 ELSE 0 END) AS voided \
                 FROM sales WHERE created_at >= ?1 AND shop_id IS NOT NULL \
                 GROUP BY shop_id \
                 HAVING confirmed >= ?2 AND CAST(voided AS REAL) / confirmed > ?3",
            )?;
            let rows = stmt.query_map(params![since_ms, min_confirmed, void_fraction], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })
    }

    // =========================================================================
    // Integrity check queries (business tables)
    // =========================================================================

    /// Stock rows with negative on-hand quantity.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_negative_stock(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.negative_stock", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, shop_id, quantity FROM stock_items WHERE quantity < 0",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let shop_id: Option<String> = row.get(1)?;
                let quantity: i64 = row.get(2)?;
                Ok((id, shop_id, quantity))
            })?;
            rows.map(|row| {
                let (id, shop_id, quantity) = row?;
                let mut record =
                    ViolationRecord::new(id, "stock_item", json!({ "quantity": quantity }));
                if let Some(shop) = shop_id {
                    record = record.with_shop(shop);
                }
                Ok(record)
            })
            .collect()
        })
    }

    /// Confirmed sales whose total differs from the sum of their line
    /// totals by more than the tolerance.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_sale_total_mismatches(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.sale_totals", |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.shop_id, s.total, \
                        COALESCE((SELECT SUM(total) FROM sale_items WHERE sale_id = s.id), 0) \
                 FROM sales s WHERE s.status = 'CONFIRMED' \
                 AND ABS(s.total - COALESCE((SELECT SUM(total) FROM sale_items \
                                             WHERE sale_id = s.id), 0)) > ?1",
            )?;
            let rows = stmt.query_map(params![AMOUNT_TOLERANCE], |row| {
                let id: String = row.get(0)?;
                let shop_id: Option<String> = row.get(1)?;
                let total: i64 = row.get(2)?;
                let line_total: i64 = row.get(3)?;
                Ok((id, shop_id, total, line_total))
            })?;
            rows.map(|row| {
                let (id, shop_id, total, line_total) = row?;
                let mut record = ViolationRecord::new(
                    id,
                    "sale",
                    json!({ "total": total, "line_item_total": line_total }),
                );
                if let Some(shop) = shop_id {
                    record = record.with_shop(shop);
                }
                Ok(record)
            })
            .collect()
        })
    }

    /// Confirmed sales whose payments plus credit differ from the total by
    /// more than the tolerance.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_payment_mismatches(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.payment_sums", |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.shop_id, s.total, s.credit_amount, \
                        COALESCE((SELECT SUM(amount) FROM payments WHERE sale_id = s.id), 0) \
                 FROM sales s WHERE s.status = 'CONFIRMED' \
                 AND ABS(COALESCE((SELECT SUM(amount) FROM payments WHERE sale_id = s.id), 0) \
                         + s.credit_amount - s.total) > ?1",
            )?;
            let rows = stmt.query_map(params![AMOUNT_TOLERANCE], |row| {
                let id: String = row.get(0)?;
                let shop_id: Option<String> = row.get(1)?;
                let total: i64 = row.get(2)?;
                let credit: i64 = row.get(3)?;
                let paid: i64 = row.get(4)?;
                Ok((id, shop_id, total, credit, paid))
            })?;
            rows.map(|row| {
                let (id, shop_id, total, credit, paid) = row?;
                let mut record = ViolationRecord::new(
                    id,
                    "sale",
                    json!({ "total": total, "paid": paid, "credit": credit }),
                );
                if let Some(shop) = shop_id {
                    record = record.with_shop(shop);
                }
                Ok(record)
            })
            .collect()
        })
    }

    /// Invoice numbers occurring more than once.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_duplicate_invoices(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.duplicate_invoices", |conn| {
            let mut stmt = conn.prepare(
                "SELECT invoice_number, COUNT(*) AS occurrences FROM sales \
                 WHERE invoice_number IS NOT NULL \
                 GROUP BY invoice_number HAVING occurrences > 1",
            )?;
            let rows = stmt.query_map([], |row| {
                let invoice: String = row.get(0)?;
                let occurrences: u32 = row.get(1)?;
                Ok((invoice, occurrences))
            })?;
            rows.map(|row| {
                let (invoice, occurrences) = row?;
                Ok(ViolationRecord::new(
                    invoice,
                    "invoice",
                    json!({ "occurrences": occurrences }),
                ))
            })
            .collect()
        })
    }

    /// Stock rows whose on-hand quantity differs from the sum of their
    /// movement deltas.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_stock_movement_imbalances(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.stock_movements", |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.shop_id, s.quantity, \
                        COALESCE((SELECT SUM(delta) FROM stock_movements \
                                  WHERE stock_item_id = s.id), 0) \
                 FROM stock_items s \
                 WHERE s.quantity != COALESCE((SELECT SUM(delta) FROM stock_movements \
                                               WHERE stock_item_id = s.id), 0)",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let shop_id: Option<String> = row.get(1)?;
                let quantity: i64 = row.get(2)?;
                let movement_sum: i64 = row.get(3)?;
                Ok((id, shop_id, quantity, movement_sum))
            })?;
            rows.map(|row| {
                let (id, shop_id, quantity, movement_sum) = row?;
                let mut record = ViolationRecord::new(
                    id,
                    "stock_item",
                    json!({ "quantity": quantity, "movement_sum": movement_sum }),
                );
                if let Some(shop) = shop_id {
                    record = record.with_shop(shop);
                }
                Ok(record)
            })
            .collect()
        })
    }

    /// Customers whose outstanding credit exceeds 105 % of their limit.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_credit_limit_breaches(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.credit_limits", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, credit_limit, outstanding_credit FROM customers \
                 WHERE outstanding_credit > credit_limit * 1.05",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let limit: i64 = row.get(1)?;
                let outstanding: i64 = row.get(2)?;
                Ok((id, limit, outstanding))
            })?;
            rows.map(|row| {
                let (id, limit, outstanding) = row?;
                Ok(ViolationRecord::new(
                    id,
                    "customer",
                    json!({ "credit_limit": limit, "outstanding_credit": outstanding }),
                ))
            })
            .collect()
        })
    }

    /// Sale items referencing a non-existent sale.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn find_orphaned_sale_items(&self) -> StorageResult<Vec<ViolationRecord>> {
        self.with_conn("integrity.orphaned_sale_items", |conn| {
            let mut stmt = conn.prepare(
                "SELECT si.id, si.sale_id FROM sale_items si \
                 WHERE NOT EXISTS (SELECT 1 FROM sales s WHERE s.id = si.sale_id)",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let sale_id: String = row.get(1)?;
                Ok((id, sale_id))
            })?;
            rows.map(|row| {
                let (id, sale_id) = row?;
                Ok(ViolationRecord::new(
                    id,
                    "sale_item",
                    json!({ "sale_id": sale_id }),
                ))
            })
            .collect()
        })
    }

    /// Deletes orphaned sale items by id. The auto-correct arm of the
    /// orphan check.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn delete_sale_items(&self, ids: &[String]) -> StorageResult<usize> {
        let mut deleted = 0;
        for id in ids {
            deleted += self.with_conn("sale_items.delete", |conn| {
                conn.execute("DELETE FROM sale_items WHERE id = ?1", params![id])
            })?;
        }
        Ok(deleted)
    }

    // =========================================================================
    // Forensics
    // =========================================================================

    /// Count of negative-stock rows, for forensic snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn negative_stock_count(&self) -> StorageResult<u32> {
        self.with_conn("forensics.negative_stock", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM stock_items WHERE quantity < 0",
                [],
                |row| row.get(0),
            )
        })
    }

    /// Count of confirmed sales whose payments do not reconcile, for
    /// forensic snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn payment_gap_count(&self) -> StorageResult<u32> {
        self.with_conn("forensics.payment_gaps", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sales s WHERE s.status = 'CONFIRMED' \
                 AND ABS(COALESCE((SELECT SUM(amount) FROM payments WHERE sale_id = s.id), 0) \
                         + s.credit_amount - s.total) > ?1",
                params![AMOUNT_TOLERANCE],
                |row| row.get(0),
            )
        })
    }

    // =========================================================================
    // Perf observations, backups, gate runs, reports
    // =========================================================================

    /// Appends one perf observation.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_perf_observation(
        &self,
        endpoint: &str,
        p95_ms: f64,
        p99_ms: f64,
        sample_count: u32,
        slow_query: Option<&str>,
        index_suggestion: Option<&str>,
        now_ms: i64,
    ) -> StorageResult<()> {
        self.with_conn("perf_observations.insert", |conn| {
            conn.execute(
                "INSERT INTO perf_observations (id, endpoint, p95_ms, p99_ms, sample_count, \
                 slow_query, index_suggestion, observed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    endpoint,
                    p95_ms,
                    p99_ms,
                    sample_count,
                    slow_query,
                    index_suggestion,
                    now_ms
                ],
            )?;
            Ok(())
        })
    }

    /// Appends one backup validation row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_backup_validation(&self, row: &BackupValidationRow) -> StorageResult<()> {
        self.with_conn("backup_validations.insert", |conn| {
            conn.execute(
                "INSERT INTO backup_validations (id, backup_file, size_kb, checksum, \
                 restore_tested, drift_clean, incident_id, validated_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.id,
                    row.backup_file,
                    row.size_kb,
                    row.checksum,
                    row.restore_tested,
                    row.drift_clean,
                    row.incident_id,
                    row.validated_at,
                    row.status
                ],
            )?;
            Ok(())
        })
    }

    /// Timestamp of the newest PASSED backup validation.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn latest_passed_backup(&self) -> StorageResult<Option<i64>> {
        self.with_conn("backup_validations.latest_passed", |conn| {
            conn.query_row(
                "SELECT validated_at FROM backup_validations \
                 WHERE status = 'PASSED' ORDER BY validated_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Appends one deployment gate run.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    pub fn insert_gate_run(
        &self,
        passed: bool,
        gates: &serde_json::Value,
        blockers: &serde_json::Value,
        triggered_by: Option<&str>,
        now_ms: i64,
    ) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        let gates = serde_json::to_string(gates)?;
        let blockers = serde_json::to_string(blockers)?;
        let run_id = id.clone();
        self.with_conn("deployment_gate_runs.insert", move |conn| {
            conn.execute(
                "INSERT INTO deployment_gate_runs (id, passed, gates, blockers, triggered_by, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, passed, gates, blockers, triggered_by, now_ms],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Upserts the executive report for `period_date` (YYYY-MM-DD).
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    pub fn upsert_executive_report(
        &self,
        period_date: &str,
        report: &serde_json::Value,
    ) -> StorageResult<()> {
        let report = serde_json::to_string(report)?;
        self.with_conn("executive_reports.upsert", |conn| {
            conn.execute(
                "INSERT INTO executive_reports (period_date, report, dispatched) \
                 VALUES (?1, ?2, 0) \
                 ON CONFLICT (period_date) DO UPDATE SET report = excluded.report",
                params![period_date, report],
            )?;
            Ok(())
        })
    }

    /// Marks the report for `period_date` as dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn mark_report_dispatched(&self, period_date: &str, now_ms: i64) -> StorageResult<()> {
        self.with_conn("executive_reports.dispatched", |conn| {
            conn.execute(
                "UPDATE executive_reports SET dispatched = 1, dispatched_at = ?2 \
                 WHERE period_date = ?1",
                params![period_date, now_ms],
            )?;
            Ok(())
        })
    }

    /// Loads the report for `period_date`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn executive_report(
        &self,
        period_date: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        let raw = self.with_conn("executive_reports.read", |conn| {
            conn.query_row(
                "SELECT report FROM executive_reports WHERE period_date = ?1",
                params![period_date],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })?;
        raw.map(|r| serde_json::from_str(&r).map_err(StorageError::from))
            .transpose()
    }

    /// Direct connection handle for test fixtures.
    #[cfg(test)]
    pub(crate) fn raw(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Liveness probe: one trivial round trip.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    pub fn ping(&self) -> StorageResult<()> {
        self.with_conn("ping", |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

const INCIDENT_SELECT: &str = "SELECT id, priority, status, title, invariant, details, \
    forensic, auto_heal_attempts, auto_healed, created_at, updated_at, resolved_at, \
    escalated_at, resolved_by, resolved_reason FROM incidents";

fn map_incident_row(row: &rusqlite::Row<'_>) -> Result<IncidentRow, rusqlite::Error> {
    let priority: String = row.get(1)?;
    let status: String = row.get(2)?;
    let details: String = row.get(5)?;
    let forensic: String = row.get(6)?;
    Ok(IncidentRow {
        id: row.get(0)?,
        priority: IncidentPriority::parse(&priority).unwrap_or(IncidentPriority::P4),
        status: IncidentStatus::parse(&status).unwrap_or(IncidentStatus::Open),
        title: row.get(3)?,
        invariant: row.get(4)?,
        details: serde_json::from_str(&details).unwrap_or_default(),
        forensic: serde_json::from_str(&forensic).unwrap_or_default(),
        auto_heal_attempts: row.get(7)?,
        auto_healed: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        resolved_at: row.get(11)?,
        escalated_at: row.get(12)?,
        resolved_by: row.get(13)?,
        resolved_reason: row.get(14)?,
    })
}
