//! Health and overload-risk scoring arithmetic.
//!
//! The health score is a weighted composite bounded \[0, 100\]: six
//! components, each clamped at its maximum, summed. The overload-risk score
//! is a separate 0–100 heuristic ranking imminent-saturation likelihood.
//! Both are pure functions of their inputs; the daemon gathers the inputs
//! and persists the outputs.

use serde::{Deserialize, Serialize};

// =============================================================================
// Health components
// =============================================================================

/// Maximum points per component.
pub const MAX_INTEGRITY: u8 = 30;
/// Maximum points for the error-rate component.
pub const MAX_ERROR_RATE: u8 = 20;
/// Maximum points for the latency component.
pub const MAX_LATENCY: u8 = 15;
/// Maximum points for the incident component.
pub const MAX_INCIDENTS: u8 = 20;
/// Maximum points for the backup component.
pub const MAX_BACKUP: u8 = 10;
/// Maximum points for the migration component.
pub const MAX_MIGRATIONS: u8 = 5;

/// Integrity component: the drift score scaled into 30 points.
#[must_use]
pub fn score_integrity(drift_score: u8) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (f64::from(drift_score.min(100)) / 100.0 * f64::from(MAX_INTEGRITY)).round() as u8;
    scaled.min(MAX_INTEGRITY)
}

/// Error-rate component, tiered on the percentage of 5xx responses.
#[must_use]
pub fn score_error_rate(error_rate_pct: f64) -> u8 {
    if error_rate_pct <= 0.0 {
        20
    } else if error_rate_pct < 0.5 {
        18
    } else if error_rate_pct < 1.0 {
        15
    } else if error_rate_pct < 3.0 {
        10
    } else if error_rate_pct < 5.0 {
        5
    } else {
        0
    }
}

/// Latency component, tiered on the overall p95 in milliseconds.
#[must_use]
pub fn score_latency(p95_ms: f64) -> u8 {
    if p95_ms <= 0.0 || p95_ms < 100.0 {
        15
    } else if p95_ms < 200.0 {
        12
    } else if p95_ms < 500.0 {
        8
    } else if p95_ms < 1000.0 {
        4
    } else {
        0
    }
}

/// Incident component: open incidents deduct by priority, floored at 0.
#[must_use]
pub fn score_incidents(p1: u32, p2: u32, p3: u32, p4: u32) -> u8 {
    let deduction = 10 * u64::from(p1) + 5 * u64::from(p2) + 2 * u64::from(p3) + u64::from(p4);
    #[allow(clippy::cast_possible_truncation)]
    {
        u64::from(MAX_INCIDENTS).saturating_sub(deduction) as u8
    }
}

/// Backup component, tiered on the age of the latest PASSED validation.
/// `None` means no passing validation exists.
#[must_use]
pub fn score_backup(age_hours: Option<f64>) -> u8 {
    match age_hours {
        Some(age) if age < 12.0 => 10,
        Some(age) if age < 24.0 => 7,
        Some(age) if age < 48.0 => 3,
        _ => 0,
    }
}

/// Migration component. `Ok(true)` means no pending migrations; a query
/// failure earns partial credit (the store answered other probes, so the
/// schema state is unknown rather than known-bad).
#[must_use]
pub fn score_migrations(pending_check: Result<bool, ()>) -> u8 {
    match pending_check {
        Ok(true) => 5,
        Ok(false) => 0,
        Err(()) => 3,
    }
}

/// The six health components, each already clamped at its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthComponents {
    /// Data-integrity points (max 30).
    pub integrity: u8,
    /// Error-rate points (max 20).
    pub error_rate: u8,
    /// Latency points (max 15).
    pub latency: u8,
    /// Open-incident points (max 20).
    pub incidents: u8,
    /// Backup-freshness points (max 10).
    pub backup: u8,
    /// Migration points (max 5).
    pub migrations: u8,
}

impl HealthComponents {
    /// Composite health score.
    #[must_use]
    pub const fn score(&self) -> u8 {
        self.integrity
            + self.error_rate
            + self.latency
            + self.incidents
            + self.backup
            + self.migrations
    }
}

/// Letter grade bands for the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthGrade {
    /// 90 and above.
    A,
    /// 75–89.
    B,
    /// 60–74.
    C,
    /// 40–59.
    D,
    /// Below 40; safe mode engages.
    F,
}

impl HealthGrade {
    /// Maps a score to its band.
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        if score >= 90 {
            Self::A
        } else if score >= 75 {
            Self::B
        } else if score >= 60 {
            Self::C
        } else if score >= 40 {
            Self::D
        } else {
            Self::F
        }
    }
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::D => write!(f, "D"),
            Self::F => write!(f, "F"),
        }
    }
}

// =============================================================================
// Overload risk
// =============================================================================

/// Inputs to the overload predictor, already reduced to scalars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverloadSignals {
    /// Worst endpoint p95 divided by its p50 baseline (0 when no baseline).
    pub latency_ratio: f64,
    /// Connection-pool saturation percentage.
    pub saturation_pct: f64,
    /// Current HTTP error rate percentage.
    pub error_rate_pct: f64,
    /// Memory growth in MB per minute.
    pub mem_growth_mb_per_min: f64,
}

/// Risk bands for the overload score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBand {
    /// Below 20.
    Low,
    /// 20–44.
    Medium,
    /// 45–69.
    High,
    /// 70 and above; opens a P2 incident.
    Critical,
}

/// Overload assessment: score plus band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverloadAssessment {
    /// 0–100 risk score.
    pub score: u8,
    /// Risk band for the score.
    pub band: RiskBand,
    /// Signals the score was derived from.
    pub signals: OverloadSignals,
}

/// Scores overload risk from the reduced signals.
#[must_use]
pub fn assess_overload(signals: OverloadSignals) -> OverloadAssessment {
    let mut score: u8 = 0;

    if signals.latency_ratio > 2.0 {
        score += 30;
    } else if signals.latency_ratio > 1.5 {
        score += 15;
    }

    if signals.saturation_pct > 85.0 {
        score += 35;
    } else if signals.saturation_pct > 70.0 {
        score += 15;
    }

    if signals.error_rate_pct > 5.0 {
        score += 30;
    } else if signals.error_rate_pct > 1.0 {
        score += 15;
    }

    if signals.mem_growth_mb_per_min > 10.0 {
        score += 20;
    }
    let score = score.min(100);

    let band = if score >= 70 {
        RiskBand::Critical
    } else if score >= 45 {
        RiskBand::High
    } else if score >= 20 {
        RiskBand::Medium
    } else {
        RiskBand::Low
    };

    OverloadAssessment {
        score,
        band,
        signals,
    }
}
