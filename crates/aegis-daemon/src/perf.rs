//! Performance engine: latency observations, slow-query and index
//! advisories, memory trend, pool saturation, and overload prediction.
//!
//! The engine is advisory: it records observations, exports gauges, and
//! raises alerts/incidents, but never acts on the store (no DDL, no
//! query rewriting). Slow-query and index signals come from whatever
//! statement-level statistics the storage layer exposes; the analysis
//! itself is pure and tested with injected data.

use std::sync::Arc;

use aegis_core::incident::IncidentPriority;
use aegis_core::latency::LatencyTracker;
use aegis_core::memtrend::{MemoryTrend, MemoryTrendTracker};
use aegis_core::metrics::{MetricsRegistry, Severity};
use aegis_core::scoring::{assess_overload, OverloadAssessment, OverloadSignals, RiskBand};
use serde_json::json;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::SharedClock;
use crate::incidents::{IncidentManager, IncidentSpec};
use crate::procinfo;
use crate::storage::{StatementStat, Storage, StorageResult, TableAccessStat};

/// Incident marker used to dedupe critical-overload incidents.
pub const OVERLOAD_INCIDENT: &str = "OVERLOAD_RISK_CRITICAL";

/// Analysis thresholds.
#[derive(Debug, Clone)]
pub struct PerfConfig {
    /// Mean execution time above which a statement is slow, in ms.
    pub slow_query_mean_ms: f64,
    /// Calls below which a statement is ignored (too little signal).
    pub slow_query_min_calls: u64,
    /// Sequential scans above which a table is index-suspect.
    pub index_seq_scan_min: u64,
    /// Tuples read sequentially above which a table is index-suspect.
    pub index_seq_tuples_min: u64,
    /// Index-to-sequential scan ratio below which an index is suggested.
    pub index_scan_ratio_max: f64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            slow_query_mean_ms: 500.0,
            slow_query_min_calls: 10,
            index_seq_scan_min: 100,
            index_seq_tuples_min: 10_000,
            index_scan_ratio_max: 0.10,
        }
    }
}

/// One slow-statement advisory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlowQuery {
    /// Statement tag.
    pub query: String,
    /// Executions observed.
    pub calls: u64,
    /// Mean execution time in ms.
    pub mean_ms: f64,
}

/// One missing-index advisory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexSuggestion {
    /// Table the advisory concerns.
    pub table: String,
    /// Advisory text.
    pub suggestion: String,
}

/// Statements slower than the configured mean with enough call volume.
#[must_use]
pub fn slow_queries(stats: &[StatementStat], config: &PerfConfig) -> Vec<SlowQuery> {
    stats
        .iter()
        .filter(|s| s.mean_ms > config.slow_query_mean_ms && s.calls > config.slow_query_min_calls)
        .map(|s| SlowQuery {
            query: s.query.clone(),
            calls: s.calls,
            mean_ms: s.mean_ms,
        })
        .collect()
}

/// Tables dominated by large sequential scans with little index use.
#[must_use]
pub fn index_suggestions(
    stats: &[TableAccessStat],
    config: &PerfConfig,
) -> Vec<IndexSuggestion> {
    stats
        .iter()
        .filter(|s| {
            #[allow(clippy::cast_precision_loss)]
            let ratio = if s.seq_scans == 0 {
                1.0
            } else {
                s.index_scans as f64 / s.seq_scans as f64
            };
            s.seq_scans > config.index_seq_scan_min
                && s.seq_tuples_read > config.index_seq_tuples_min
                && ratio < config.index_scan_ratio_max
        })
        .map(|s| IndexSuggestion {
            table: s.table.clone(),
            suggestion: format!(
                "{} sequential scans read {} tuples with {} index scans; consider an index",
                s.seq_scans, s.seq_tuples_read, s.index_scans
            ),
        })
        .collect()
}

/// Outcome of one analysis cycle.
#[derive(Debug)]
pub struct PerfReport {
    /// Endpoints with latency samples this cycle.
    pub endpoints_observed: usize,
    /// Slow-statement advisories.
    pub slow_queries: Vec<SlowQuery>,
    /// Missing-index advisories.
    pub index_suggestions: Vec<IndexSuggestion>,
    /// Overload assessment.
    pub overload: OverloadAssessment,
    /// Memory trend at analysis time.
    pub memory: MemoryTrend,
}

/// The performance engine.
pub struct PerformanceEngine {
    storage: Storage,
    incidents: Arc<IncidentManager>,
    alerts: AlertDispatcher,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    latency: Arc<LatencyTracker>,
    memory: MemoryTrendTracker,
    config: PerfConfig,
}

impl PerformanceEngine {
    /// Creates the engine sharing the middleware's latency tracker.
    #[must_use]
    pub fn new(
        storage: Storage,
        incidents: Arc<IncidentManager>,
        alerts: AlertDispatcher,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        latency: Arc<LatencyTracker>,
        config: PerfConfig,
    ) -> Self {
        Self {
            storage,
            incidents,
            alerts,
            clock,
            registry,
            latency,
            memory: MemoryTrendTracker::new(),
            config,
        }
    }

    /// Shared latency tracker.
    #[must_use]
    pub fn latency(&self) -> Arc<LatencyTracker> {
        Arc::clone(&self.latency)
    }

    /// Minute sampler: records the current resident heap size.
    pub fn sample_memory(&self) {
        let Some(heap_mb) = procinfo::heap_used_mb() else {
            return;
        };
        self.memory.sample(heap_mb, self.clock.now_ms());
        self.registry.set_gauge("mem.heap_mb", heap_mb);
    }

    /// Test/diagnostic hook: records an explicit heap sample.
    pub fn record_memory_sample(&self, heap_mb: f64, at_ms: i64) {
        self.memory.sample(heap_mb, at_ms);
    }

    /// Runs one analysis cycle.
    ///
    /// # Errors
    ///
    /// Returns an error when persisting observations fails.
    pub fn run_analysis(&self) -> StorageResult<PerfReport> {
        let now = self.clock.now_ms();

        let slow = slow_queries(&self.storage.statement_stats(), &self.config);
        let indices = index_suggestions(&self.storage.table_access_stats(), &self.config);
        let memory = self.memory.trend();
        let activity = self.storage.activity_stats();
        let saturation_pct = activity.saturation_pct();
        self.registry.set_gauge("db.pool.saturation", saturation_pct);
        self.registry
            .set_gauge("mem.growth_mb_per_min", memory.slope_mb_per_min);

        // Worst endpoint p95 against its own p50 baseline.
        let snapshot = self.latency.snapshot();
        let latency_ratio = snapshot
            .values()
            .filter(|s| s.p50_ms > 0.0)
            .map(|s| s.p95_ms / s.p50_ms)
            .fold(0.0_f64, f64::max);

        let overload = assess_overload(OverloadSignals {
            latency_ratio,
            saturation_pct,
            error_rate_pct: self.registry.gauge("http.error_rate"),
            mem_growth_mb_per_min: memory.slope_mb_per_min,
        });
        self.registry
            .set_gauge("perf.overload_risk", f64::from(overload.score));

        // Persist per-endpoint observations; database-level advisories ride
        // on a synthetic endpoint so the row shape stays uniform.
        for (endpoint, summary) in &snapshot {
            #[allow(clippy::cast_possible_truncation)]
            self.storage.insert_perf_observation(
                endpoint,
                summary.p95_ms,
                summary.p99_ms,
                summary.sample_count as u32,
                None,
                None,
                now,
            )?;
        }
        if !slow.is_empty() || !indices.is_empty() {
            let slow_text = serde_json::to_string(&slow)?;
            let index_text = serde_json::to_string(&indices)?;
            self.storage.insert_perf_observation(
                "_database",
                0.0,
                0.0,
                0,
                if slow.is_empty() { None } else { Some(&slow_text) },
                if indices.is_empty() {
                    None
                } else {
                    Some(&index_text)
                },
                now,
            )?;
            self.alerts.send(Alert::new(
                Severity::Medium,
                "Database performance advisories",
                format!(
                    "{} slow statements, {} index suggestions",
                    slow.len(),
                    indices.len()
                ),
            ));
        }

        if overload.band == RiskBand::Critical {
            let already_open = self
                .storage
                .active_incident_for_invariant(OVERLOAD_INCIDENT)?
                .is_some();
            if !already_open {
                if let Err(err) = self.incidents.create_incident(IncidentSpec {
                    priority: IncidentPriority::P2,
                    title: "Critical overload risk predicted".to_string(),
                    invariant: Some(OVERLOAD_INCIDENT.to_string()),
                    details: json!({
                        "score": overload.score,
                        "signals": overload.signals,
                    }),
                }) {
                    error!(error = %err, "failed to open overload incident");
                }
            }
            warn!(score = overload.score, "overload risk critical");
        }

        info!(
            endpoints = snapshot.len(),
            slow = slow.len(),
            overload_score = overload.score,
            band = ?overload.band,
            "perf analysis complete"
        );
        Ok(PerfReport {
            endpoints_observed: snapshot.len(),
            slow_queries: slow,
            index_suggestions: indices,
            overload,
            memory,
        })
    }
}
