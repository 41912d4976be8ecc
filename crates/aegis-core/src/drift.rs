//! Composite drift scoring over the invariant catalogue.
//!
//! The drift score is a 0–100 integer reflecting data-integrity health:
//! 100 is clean. Each failed invariant deducts
//! `min(weight, weight * log10(count + 1))`, so a single rogue row hurts
//! far less than a widespread class of violations, while no invariant can
//! deduct more than its weight. Unknown invariant names carry a default
//! weight so a catalogue addition cannot silently score as free.

use std::collections::HashMap;

use serde::Serialize;

use crate::invariant::InvariantResult;

/// Deduction weight for invariants not in the table.
pub const DEFAULT_WEIGHT: f64 = 5.0;

/// Deduction weight per invariant name.
#[must_use]
pub fn weight_for(invariant: &str) -> f64 {
    match invariant {
        "NO_NEGATIVE_STOCK" => 25.0,
        "SALE_TOTAL_MATCHES_LINE_ITEMS" | "PAYMENT_SUM_MATCHES_SALE_TOTAL" => 20.0,
        "NO_DUPLICATE_INVOICES" => 15.0,
        "STOCK_MOVEMENT_BALANCE" => 10.0,
        "CREDIT_LIMIT_NOT_EXCEEDED" => 7.0,
        "NO_ORPHANED_SALE_ITEMS" => 3.0,
        _ => DEFAULT_WEIGHT,
    }
}

/// Per-invariant contribution recorded with each drift sample.
#[derive(Debug, Clone, Serialize)]
pub struct DriftComponent {
    /// Whether the invariant passed this cycle.
    pub passed: bool,
    /// Violations counted this cycle.
    pub count: usize,
}

/// Deduction one failed result contributes.
#[must_use]
pub fn deduction_for(result: &InvariantResult) -> f64 {
    if result.passed {
        return 0.0;
    }
    let weight = weight_for(&result.name);
    #[allow(clippy::cast_precision_loss)]
    let scaled = weight * ((result.violation_count() as f64) + 1.0).log10();
    scaled.min(weight)
}

/// Computes the composite drift score for one cycle. Pure: equal inputs
/// yield equal outputs.
#[must_use]
pub fn compute_drift_score(results: &[InvariantResult]) -> u8 {
    let total_deduction: f64 = results.iter().map(deduction_for).sum();
    let score = (100.0 - total_deduction).max(0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        score.round() as u8
    }
}

/// Per-invariant component map persisted with each drift sample.
#[must_use]
pub fn components_of(results: &[InvariantResult]) -> HashMap<String, DriftComponent> {
    results
        .iter()
        .map(|r| {
            (
                r.name.clone(),
                DriftComponent {
                    passed: r.passed,
                    count: r.violation_count(),
                },
            )
        })
        .collect()
}
