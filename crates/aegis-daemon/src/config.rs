//! Daemon configuration.
//!
//! Defaults are compiled in; the environment overrides individual knobs.
//! Job cadences are read from the `*_INTERVAL_MS` variables, transports
//! from the webhook variables. Anything unset keeps its default, and a
//! malformed numeric override is ignored with a warning rather than
//! refusing to boot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime stage, deciding among other things whether deployment gates run
/// at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStage {
    /// Local development.
    Development,
    /// Pre-production.
    Staging,
    /// Production: gates run at boot.
    Production,
}

impl RuntimeStage {
    /// Parses the conventional stage labels.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    /// Whether deployment gates run during bootstrap.
    #[must_use]
    pub const fn gates_at_boot(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Cadences for the scheduled jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIntervals {
    /// Invariant engine cycle.
    #[serde(with = "humantime_serde")]
    pub invariant: Duration,
    /// Performance analysis cycle.
    #[serde(with = "humantime_serde")]
    pub perf: Duration,
    /// Security pattern scan cycle.
    #[serde(with = "humantime_serde")]
    pub security: Duration,
    /// Health score computation.
    #[serde(with = "humantime_serde")]
    pub health: Duration,
    /// Backup validation.
    #[serde(with = "humantime_serde")]
    pub backup: Duration,
    /// Executive report generation.
    #[serde(with = "humantime_serde")]
    pub exec_report: Duration,
    /// Idempotency record garbage collection.
    #[serde(with = "humantime_serde")]
    pub idempotency_clean: Duration,
    /// Rate-limiter window cleanup.
    #[serde(with = "humantime_serde")]
    pub ratelimit_clean: Duration,
}

impl Default for JobIntervals {
    fn default() -> Self {
        Self {
            invariant: Duration::from_millis(300_000),
            perf: Duration::from_millis(600_000),
            security: Duration::from_millis(900_000),
            health: Duration::from_millis(300_000),
            backup: Duration::from_millis(86_400_000),
            exec_report: Duration::from_millis(86_400_000),
            idempotency_clean: Duration::from_millis(3_600_000),
            ratelimit_clean: Duration::from_millis(900_000),
        }
    }
}

/// Alert and report transports. Unset transports are skipped silently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transports {
    /// Primary alert webhook.
    pub alert_webhook_url: Option<String>,
    /// Executive report webhook.
    pub executive_webhook_url: Option<String>,
    /// Secondary alert channel.
    pub slack_webhook_url: Option<String>,
    /// Paging integration key.
    pub pagerduty_routing_key: Option<String>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Runtime stage.
    pub stage: RuntimeStage,
    /// Job cadences.
    pub intervals: JobIntervals,
    /// Alert/report transports.
    pub transports: Transports,
    /// Optional secondary store for backup restore tests.
    pub shadow_db_url: Option<String>,
    /// Optional encryption recipient for backups.
    pub gpg_key_id: Option<String>,
    /// Directory scanned for backup dumps.
    pub backup_dir: String,
    /// Requests per minute allowed per client IP.
    pub rate_limit_per_minute: u32,
    /// Idempotency record TTL.
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stage: RuntimeStage::Development,
            intervals: JobIntervals::default(),
            transports: Transports::default(),
            shadow_db_url: None,
            gpg_key_id: None,
            backup_dir: "backups".to_string(),
            rate_limit_per_minute: 100,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DaemonConfig {
    /// Builds a configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(stage) = std::env::var("AEGIS_ENV") {
            config.stage = RuntimeStage::parse(&stage);
        }

        override_interval(&mut config.intervals.invariant, "INVARIANT_INTERVAL_MS");
        override_interval(&mut config.intervals.perf, "PERF_INTERVAL_MS");
        override_interval(&mut config.intervals.security, "SECURITY_INTERVAL_MS");
        override_interval(&mut config.intervals.health, "HEALTH_INTERVAL_MS");
        override_interval(&mut config.intervals.backup, "BACKUP_INTERVAL_MS");
        override_interval(&mut config.intervals.exec_report, "EXEC_REPORT_INTERVAL_MS");
        override_interval(
            &mut config.intervals.idempotency_clean,
            "IDEMPOTENCY_CLEAN_MS",
        );
        override_interval(
            &mut config.intervals.ratelimit_clean,
            "RATELIMIT_CLEAN_MS",
        );

        config.transports.alert_webhook_url = std::env::var("ALERT_WEBHOOK_URL").ok();
        config.transports.executive_webhook_url = std::env::var("EXECUTIVE_WEBHOOK_URL").ok();
        config.transports.slack_webhook_url = std::env::var("SLACK_WEBHOOK_URL").ok();
        config.transports.pagerduty_routing_key = std::env::var("PAGERDUTY_ROUTING_KEY").ok();
        config.shadow_db_url = std::env::var("SHADOW_DB_URL").ok();
        config.gpg_key_id = std::env::var("GPG_KEY_ID").ok();
        if let Ok(dir) = std::env::var("BACKUP_DIR") {
            config.backup_dir = dir;
        }

        config
    }
}

fn override_interval(slot: &mut Duration, var: &str) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => *slot = Duration::from_millis(ms),
        _ => warn!(var, value = %raw, "ignoring malformed interval override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cadences_match_contract() {
        let intervals = JobIntervals::default();
        assert_eq!(intervals.invariant, Duration::from_secs(300));
        assert_eq!(intervals.perf, Duration::from_secs(600));
        assert_eq!(intervals.security, Duration::from_secs(900));
        assert_eq!(intervals.health, Duration::from_secs(300));
        assert_eq!(intervals.backup, Duration::from_secs(86_400));
        assert_eq!(intervals.exec_report, Duration::from_secs(86_400));
        assert_eq!(intervals.idempotency_clean, Duration::from_secs(3_600));
        assert_eq!(intervals.ratelimit_clean, Duration::from_secs(900));
    }

    #[test]
    fn stage_parsing() {
        assert_eq!(RuntimeStage::parse("production"), RuntimeStage::Production);
        assert_eq!(RuntimeStage::parse("PROD"), RuntimeStage::Production);
        assert_eq!(RuntimeStage::parse("staging"), RuntimeStage::Staging);
        assert_eq!(RuntimeStage::parse("anything"), RuntimeStage::Development);
        assert!(RuntimeStage::Production.gates_at_boot());
        assert!(!RuntimeStage::Development.gates_at_boot());
    }
}
