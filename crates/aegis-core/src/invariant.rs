//! Invariant catalogue data types.
//!
//! An invariant is a predicate over persisted business state that must hold
//! at all times. The engine runs each catalogue entry's check, collects
//! counter-examples as [`ViolationRecord`]s, and folds them into one
//! [`InvariantResult`] per invariant per cycle. The catalogue itself (the
//! checks and their SQL) lives in the daemon; these types are the contract
//! between the checks, the drift scorer, and the incident manager.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::incident::IncidentPriority;

/// One counter-example found by an invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Identifier of the offending entity.
    pub entity_id: String,
    /// Kind of the offending entity (`stock_item`, `sale`, ...).
    pub entity_type: String,
    /// Tenant scope, when the entity belongs to one shop.
    pub shop_id: Option<String>,
    /// Check-specific diagnostic payload.
    pub detail: serde_json::Value,
}

impl ViolationRecord {
    /// Creates a violation without a shop scope.
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            shop_id: None,
            detail,
        }
    }

    /// Attaches a shop scope.
    #[must_use]
    pub fn with_shop(mut self, shop_id: impl Into<String>) -> Self {
        self.shop_id = Some(shop_id.into());
        self
    }
}

/// Outcome of running one invariant check for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantResult {
    /// Stable invariant name (part of the external contract).
    pub name: String,
    /// Priority the invariant's violations carry.
    pub priority: IncidentPriority,
    /// `true` when no violations remain (none found, or all corrected).
    pub passed: bool,
    /// Per-result score `max(0, 100 - 10 * violations)`.
    pub drift_score: u8,
    /// Counter-examples found this cycle.
    pub violations: Vec<ViolationRecord>,
    /// Whether an auto-correction ran and succeeded.
    pub auto_corrected: bool,
}

impl InvariantResult {
    /// Builds a result from a completed check.
    #[must_use]
    pub fn from_check(
        name: impl Into<String>,
        priority: IncidentPriority,
        violations: Vec<ViolationRecord>,
        auto_corrected: bool,
    ) -> Self {
        let passed = violations.is_empty() || auto_corrected;
        #[allow(clippy::cast_possible_truncation)]
        let drift_score = 100_u64.saturating_sub(10 * violations.len() as u64).min(100) as u8;
        Self {
            name: name.into(),
            priority,
            passed,
            drift_score,
            violations,
            auto_corrected,
        }
    }

    /// Synthetic failed result for a check that raised instead of
    /// completing. Carries a single violation describing the failure so the
    /// drift deduction registers.
    #[must_use]
    pub fn from_check_error(
        name: impl Into<String>,
        priority: IncidentPriority,
        error: &str,
    ) -> Self {
        let violation = ViolationRecord::new(
            "check",
            "invariant_check",
            json!({ "error": error }),
        );
        Self {
            name: name.into(),
            priority,
            passed: false,
            drift_score: 90,
            violations: vec![violation],
            auto_corrected: false,
        }
    }

    /// Number of violations found this cycle.
    #[must_use]
    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }
}
