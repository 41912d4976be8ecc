//! Executive report generation and dispatch.
//!
//! One report per UTC day, upserted so re-runs refresh the same period. The
//! report aggregates the day's operational posture: latest health sample,
//! open incidents, drift trend over the last 24 h, security event counts,
//! backup freshness, and safe-mode state. When an executive webhook is
//! configured the report is posted there and the row marked dispatched.

use std::sync::Arc;
use std::time::Duration;

use aegis_core::metrics::MetricsRegistry;
use serde_json::json;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::storage::{Storage, StorageError, StorageResult};

/// Dispatch timeout.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The executive reporter.
pub struct ExecutiveReporter {
    storage: Storage,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl ExecutiveReporter {
    /// Creates the reporter.
    #[must_use]
    pub fn new(
        storage: Storage,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            storage,
            clock,
            registry,
            webhook_url,
            client: reqwest::Client::builder()
                .timeout(DISPATCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Builds the report for the current UTC day.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn build(&self) -> StorageResult<serde_json::Value> {
        let now = self.clock.now_ms();
        let day_ago = now - 24 * 60 * 60 * 1000;

        let health = self.storage.latest_health_score()?.map(|(score, components, at)| {
            json!({ "score": score, "components": components, "recorded_at": at })
        });
        let incidents = self.storage.open_incident_counts()?;
        let drift = self.storage.drift_scores_since(day_ago)?;
        let drift_summary = if drift.is_empty() {
            json!(null)
        } else {
            let scores: Vec<u8> = drift.iter().map(|(score, _)| *score).collect();
            let min = scores.iter().min().copied().unwrap_or(0);
            let latest = scores.first().copied().unwrap_or(0);
            #[allow(clippy::cast_precision_loss)]
            let avg = scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64;
            json!({ "latest": latest, "min": min, "avg": avg, "samples": scores.len() })
        };
        let security_events = self.storage.security_event_counts_since(day_ago)?;
        let backup_age_hours = self
            .storage
            .latest_passed_backup()?
            .map(|at| (now - at) as f64 / 3_600_000.0);
        let safe_mode = self.storage.safe_mode_state()?.safe_mode;

        Ok(json!({
            "period_date": self.period_date(),
            "generated_at": now,
            "health": health,
            "incidents": {
                "p1": incidents.p1,
                "p2": incidents.p2,
                "p3": incidents.p3,
                "p4": incidents.p4,
                "total": incidents.total(),
            },
            "drift": drift_summary,
            "security_events_24h": security_events,
            "backup_age_hours": backup_age_hours,
            "safe_mode": safe_mode,
            "error_rate_pct": self.registry.gauge("http.error_rate"),
        }))
    }

    /// Builds, persists, and (when configured) dispatches today's report.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure. Dispatch failures are logged
    /// and leave the row undispatched for the next run.
    pub async fn generate_and_dispatch(&self) -> Result<serde_json::Value, StorageError> {
        let period = self.period_date();
        let report = self.build()?;
        self.storage.upsert_executive_report(&period, &report)?;
        self.registry.increment("reports.generated");

        if let Some(url) = &self.webhook_url {
            match self.client.post(url).json(&report).send().await {
                Ok(response) if response.status().is_success() => {
                    self.storage
                        .mark_report_dispatched(&period, self.clock.now_ms())?;
                    self.registry.increment("reports.dispatched");
                    info!(period, "executive report dispatched");
                },
                Ok(response) => {
                    warn!(period, status = %response.status(), "executive report rejected");
                },
                Err(err) => {
                    warn!(period, error = %err, "executive report dispatch failed");
                },
            }
        }
        Ok(report)
    }

    fn period_date(&self) -> String {
        self.clock.now().format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json as j;

    use super::*;
    use crate::clock::ManualClock;

    fn reporter() -> (ExecutiveReporter, Storage) {
        let storage = Storage::open_in_memory().expect("storage");
        // 2024-01-02 03:04:05 UTC.
        let clock = Arc::new(ManualClock::new(1_704_164_645_000));
        let reporter = ExecutiveReporter::new(
            storage.clone(),
            clock as SharedClock,
            Arc::new(MetricsRegistry::new()),
            None,
        );
        (reporter, storage)
    }

    #[tokio::test]
    async fn report_aggregates_and_upserts_by_period() {
        let (reporter, storage) = reporter();
        storage
            .insert_drift_score(95, &j!({}), 1_704_164_000_000)
            .expect("drift");
        storage
            .insert_health_score(88, &j!({"integrity": 28}), false, 1_704_164_100_000)
            .expect("health");

        let report = reporter.generate_and_dispatch().await.expect("generate");
        assert_eq!(report["period_date"], "2024-01-02");
        assert_eq!(report["health"]["score"], 88);
        assert_eq!(report["drift"]["latest"], 95);
        assert_eq!(report["incidents"]["total"], 0);
        assert_eq!(report["safe_mode"], false);

        // A second run the same day replaces the stored row.
        reporter.generate_and_dispatch().await.expect("generate");
        let stored = storage
            .executive_report("2024-01-02")
            .expect("read")
            .expect("exists");
        assert_eq!(stored["period_date"], "2024-01-02");
    }

    #[tokio::test]
    async fn empty_store_produces_a_null_shaped_report() {
        let (reporter, _storage) = reporter();
        let report = reporter.build().expect("build");
        assert!(report["health"].is_null());
        assert!(report["drift"].is_null());
        assert!(report["backup_age_hours"].is_null());
    }
}
