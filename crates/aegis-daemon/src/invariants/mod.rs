//! Invariant engine.
//!
//! Runs the catalogue in registration order, attempts safe auto-correction,
//! computes the composite drift score, persists a bounded sample of the
//! violations, and folds every result into the incident manager — strictly
//! after all checks complete, so the drift sample reflects one coherent
//! snapshot of the cycle.
//!
//! A check that errors (missing table, query failure) is logged and
//! converted into a synthetic failed result; it never aborts the cycle.

pub mod catalogue;

use std::sync::Arc;

use aegis_core::drift::{components_of, compute_drift_score};
use aegis_core::incident::IncidentPriority;
use aegis_core::invariant::{InvariantResult, ViolationRecord};
use aegis_core::metrics::MetricsRegistry;
use serde_json::json;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::incidents::IncidentManager;
use crate::storage::{Storage, StorageError, StorageResult};

/// Violations persisted per cycle, across all invariants. The engine is a
/// surveillance mechanism, not a bulk audit log.
pub const MAX_PERSISTED_VIOLATIONS_PER_CYCLE: usize = 100;

/// One integrity check over the business tables.
pub trait Invariant: Send + Sync {
    /// Stable identifier; part of the external contract.
    fn name(&self) -> &'static str;

    /// Priority the invariant's violations carry.
    fn priority(&self) -> IncidentPriority;

    /// Whether [`Invariant::auto_correct`] may run.
    fn safe_to_auto_correct(&self) -> bool {
        false
    }

    /// Finds counter-examples.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying query fails; the engine turns
    /// it into a synthetic failed result.
    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>>;

    /// Repairs the found violations. Only invoked when
    /// [`Invariant::safe_to_auto_correct`] is `true`.
    ///
    /// # Errors
    ///
    /// Returns an error when the repair fails; the result then counts as
    /// uncorrected.
    fn auto_correct(
        &self,
        storage: &Storage,
        violations: &[ViolationRecord],
    ) -> StorageResult<()> {
        let _ = (storage, violations);
        Ok(())
    }
}

/// Outcome of one engine cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    /// Composite drift score persisted for this cycle.
    pub drift_score: u8,
    /// Per-invariant results in registration order.
    pub results: Vec<InvariantResult>,
}

/// The invariant engine.
pub struct InvariantEngine {
    storage: Storage,
    incidents: Arc<IncidentManager>,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    catalogue: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Creates an engine over the default catalogue.
    #[must_use]
    pub fn new(
        storage: Storage,
        incidents: Arc<IncidentManager>,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self::with_catalogue(
            storage,
            incidents,
            clock,
            registry,
            catalogue::default_catalogue(),
        )
    }

    /// Creates an engine over a custom catalogue (tests, partial deploys).
    #[must_use]
    pub fn with_catalogue(
        storage: Storage,
        incidents: Arc<IncidentManager>,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        catalogue: Vec<Box<dyn Invariant>>,
    ) -> Self {
        Self {
            storage,
            incidents,
            clock,
            registry,
            catalogue,
        }
    }

    /// Runs one full cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only when persisting the cycle's own rows fails;
    /// individual check failures are folded into the results.
    pub fn run_cycle(&self) -> StorageResult<CycleOutcome> {
        let mut results = Vec::with_capacity(self.catalogue.len());

        for invariant in &self.catalogue {
            results.push(self.run_check(invariant.as_ref()));
        }

        let drift_score = compute_drift_score(&results);
        let components = serde_json::to_value(components_of(&results))?;
        let now = self.clock.now_ms();
        self.storage
            .insert_drift_score(drift_score, &components, now)?;
        self.registry
            .set_gauge("invariants.drift_score", f64::from(drift_score));

        // Incident folding happens only after every check has completed.
        let mut incident_ids = Vec::with_capacity(results.len());
        for result in &results {
            let incident_id = self
                .incidents
                .create_or_update_from_invariant(result)
                .map_err(|err| {
                    error!(invariant = %result.name, error = %err, "incident fold failed");
                    err
                })
                .ok()
                .flatten();
            incident_ids.push(incident_id);
        }

        let mut budget = MAX_PERSISTED_VIOLATIONS_PER_CYCLE;
        for (result, incident_id) in results.iter().zip(&incident_ids) {
            if result.violations.is_empty() || budget == 0 {
                continue;
            }
            let take = result.violations.len().min(budget);
            self.storage.insert_violations(
                &result.name,
                &result.violations[..take],
                result.auto_corrected,
                incident_id.as_deref(),
                now,
            )?;
            budget -= take;
        }

        let failed = results.iter().filter(|r| !r.passed).count();
        info!(drift_score, failed, "invariant cycle complete");
        Ok(CycleOutcome {
            drift_score,
            results,
        })
    }

    fn run_check(&self, invariant: &dyn Invariant) -> InvariantResult {
        let name = invariant.name();
        match invariant.check(&self.storage) {
            Ok(violations) => {
                let mut auto_corrected = false;
                if !violations.is_empty() && invariant.safe_to_auto_correct() {
                    match invariant.auto_correct(&self.storage, &violations) {
                        Ok(()) => {
                            auto_corrected = true;
                            self.registry.increment("invariants.auto_corrections");
                            info!(
                                invariant = name,
                                count = violations.len(),
                                "violations auto-corrected"
                            );
                        },
                        Err(err) => {
                            warn!(invariant = name, error = %err, "auto-correct failed");
                        },
                    }
                }
                if !violations.is_empty() {
                    self.registry
                        .increment_by("invariants.violations", violations.len() as u64);
                }
                InvariantResult::from_check(name, invariant.priority(), violations, auto_corrected)
            },
            Err(err) => {
                error!(invariant = name, error = %err, "invariant check failed");
                self.registry.increment("invariants.check_errors");
                InvariantResult::from_check_error(name, invariant.priority(), &err.to_string())
            },
        }
    }

    /// Latest drift score with its timestamp, for gates and dashboards.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn latest_drift_score(&self) -> Result<Option<(u8, i64)>, StorageError> {
        self.storage.latest_drift_score()
    }
}
