//! Incident priority and lifecycle types.
//!
//! An incident is a durable record of an anomalous condition. Its status
//! moves monotonically forward through the lifecycle; terminal states are
//! sticky and backward transitions are rejected:
//!
//! ```text
//!   OPEN ──violation recurs──► AUTO_HEALING ──threshold──► ESCALATED
//!    │                            │                            │
//!    │                            └──violation clears──► RESOLVED ──► CLOSED
//!    └──violation clears──► RESOLVED ──► CLOSED
//! ```

use serde::{Deserialize, Serialize};

use crate::metrics::Severity;

/// Heal attempts after which an incident escalates.
pub const MAX_HEAL_ATTEMPTS: u32 = 3;

/// Incident age after which an unhealed incident escalates, in
/// milliseconds (15 minutes).
pub const ESCALATION_AGE_MS: i64 = 15 * 60 * 1000;

/// Priority band; P1 is the highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum IncidentPriority {
    /// Highest priority: data corruption, tamper, active damage.
    P1,
    /// Significant degradation needing prompt attention.
    P2,
    /// Noteworthy but contained.
    P3,
    /// Housekeeping.
    P4,
}

impl IncidentPriority {
    /// Alert severity an incident of this priority emits on creation.
    #[must_use]
    pub const fn alert_severity(self) -> Severity {
        match self {
            Self::P1 => Severity::Critical,
            Self::P2 => Severity::High,
            Self::P3 => Severity::Medium,
            Self::P4 => Severity::Low,
        }
    }

    /// Stable storage/wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
            Self::P4 => "P4",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            "P4" => Some(Self::P4),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    /// Newly created, untouched by healing.
    Open,
    /// A recurring violation is being auto-healed.
    AutoHealing,
    /// Healing gave up; a human owns it now.
    Escalated,
    /// The condition cleared (manually or by auto-heal).
    Resolved,
    /// Post-resolution follow-up complete.
    Closed,
}

impl IncidentStatus {
    /// Stable storage/wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::AutoHealing => "AUTO_HEALING",
            Self::Escalated => "ESCALATED",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "OPEN" => Some(Self::Open),
            "AUTO_HEALING" => Some(Self::AutoHealing),
            "ESCALATED" => Some(Self::Escalated),
            "RESOLVED" => Some(Self::Resolved),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions except
    /// RESOLVED → CLOSED.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }

    /// Returns `true` when the incident still counts as open for gates and
    /// summaries.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::AutoHealing | Self::Escalated)
    }

    /// Whether the lifecycle permits moving from `self` to `next`. Statuses
    /// only move forward; the sole post-terminal move is RESOLVED → CLOSED.
    #[must_use]
    pub const fn can_transition_to(self, next: IncidentStatus) -> bool {
        match self {
            Self::Open => matches!(
                next,
                Self::AutoHealing | Self::Escalated | Self::Resolved
            ),
            Self::AutoHealing => matches!(next, Self::Escalated | Self::Resolved),
            Self::Escalated => matches!(next, Self::Resolved),
            Self::Resolved => matches!(next, Self::Closed),
            Self::Closed => false,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Escalation rule: too many heal attempts, or too old without clearing.
#[must_use]
pub const fn should_escalate(heal_attempts: u32, age_ms: i64) -> bool {
    heal_attempts >= MAX_HEAL_ATTEMPTS || age_ms > ESCALATION_AGE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_alert_severity_mapping() {
        assert_eq!(IncidentPriority::P1.alert_severity(), Severity::Critical);
        assert_eq!(IncidentPriority::P2.alert_severity(), Severity::High);
        assert_eq!(IncidentPriority::P3.alert_severity(), Severity::Medium);
        assert_eq!(IncidentPriority::P4.alert_severity(), Severity::Low);
    }

    #[test]
    fn labels_roundtrip() {
        for p in [
            IncidentPriority::P1,
            IncidentPriority::P2,
            IncidentPriority::P3,
            IncidentPriority::P4,
        ] {
            assert_eq!(IncidentPriority::parse(p.as_str()), Some(p));
        }
        for s in [
            IncidentStatus::Open,
            IncidentStatus::AutoHealing,
            IncidentStatus::Escalated,
            IncidentStatus::Resolved,
            IncidentStatus::Closed,
        ] {
            assert_eq!(IncidentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(IncidentStatus::parse("BOGUS"), None);
    }

    #[test]
    fn transitions_are_monotone_forward() {
        use IncidentStatus::*;
        assert!(Open.can_transition_to(AutoHealing));
        assert!(Open.can_transition_to(Escalated));
        assert!(Open.can_transition_to(Resolved));
        assert!(AutoHealing.can_transition_to(Escalated));
        assert!(AutoHealing.can_transition_to(Resolved));
        assert!(Escalated.can_transition_to(Resolved));
        assert!(Resolved.can_transition_to(Closed));

        // No backward or self transitions.
        assert!(!AutoHealing.can_transition_to(Open));
        assert!(!Escalated.can_transition_to(Open));
        assert!(!Escalated.can_transition_to(AutoHealing));
        assert!(!Resolved.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Resolved));
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn terminal_and_active_partitions() {
        use IncidentStatus::*;
        assert!(Resolved.is_terminal());
        assert!(Closed.is_terminal());
        assert!(Open.is_active());
        assert!(AutoHealing.is_active());
        assert!(Escalated.is_active());
        assert!(!Resolved.is_active());
    }

    #[test]
    fn escalation_rule() {
        assert!(!should_escalate(2, 0));
        assert!(should_escalate(3, 0));
        assert!(!should_escalate(0, ESCALATION_AGE_MS));
        assert!(should_escalate(0, ESCALATION_AGE_MS + 1));
    }
}
