//! Backup validation job.
//!
//! Each run validates the newest dump in the backup directory: records its
//! size and SHA-256 checksum, optionally restore-tests it against the
//! shadow store, and checks that the latest drift score was clean at
//! validation time. A failed validation writes a FAILED row, opens a P1
//! incident, and leaves the job scheduled — the next run revalidates from
//! scratch.
//!
//! The dump itself is produced by an external utility; this job only
//! judges the artifact it finds.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aegis_core::incident::IncidentPriority;
use aegis_core::metrics::MetricsRegistry;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::incidents::{IncidentManager, IncidentSpec};
use crate::storage::{BackupValidationRow, Storage, StorageResult};

/// Drift score at or above which a backup is considered drift-clean.
pub const DRIFT_CLEAN_MIN: u8 = 85;

/// Outcome of one validation run.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// PENDING, PASSED, or FAILED.
    pub status: String,
    /// Validated file, when one was found.
    pub backup_file: Option<String>,
    /// Incident opened on failure.
    pub incident_id: Option<String>,
}

/// The backup validator.
pub struct BackupValidator {
    storage: Storage,
    incidents: Arc<IncidentManager>,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    backup_dir: PathBuf,
    shadow_db_url: Option<String>,
}

impl BackupValidator {
    /// Creates the validator.
    #[must_use]
    pub fn new(
        storage: Storage,
        incidents: Arc<IncidentManager>,
        clock: SharedClock,
        registry: Arc<MetricsRegistry>,
        backup_dir: impl Into<PathBuf>,
        shadow_db_url: Option<String>,
    ) -> Self {
        Self {
            storage,
            incidents,
            clock,
            registry,
            backup_dir: backup_dir.into(),
            shadow_db_url,
        }
    }

    /// Validates the newest dump.
    ///
    /// # Errors
    ///
    /// Returns an error when the validation row cannot be persisted;
    /// everything about the dump itself is folded into the outcome.
    pub fn run_validation(&self) -> StorageResult<ValidationOutcome> {
        let now = self.clock.now_ms();
        let drift_clean = self
            .storage
            .latest_drift_score()?
            .is_some_and(|(score, _)| score >= DRIFT_CLEAN_MIN);

        let Some(newest) = newest_file(&self.backup_dir) else {
            warn!(dir = %self.backup_dir.display(), "no backup dump found");
            let incident_id = self.open_failure_incident("no backup dump found");
            self.storage.insert_backup_validation(&BackupValidationRow {
                id: Uuid::new_v4().to_string(),
                backup_file: String::new(),
                size_kb: 0,
                checksum: None,
                restore_tested: false,
                drift_clean,
                incident_id: incident_id.clone(),
                validated_at: now,
                status: "FAILED".to_string(),
            })?;
            self.registry.increment("backup.validations_failed");
            return Ok(ValidationOutcome {
                status: "FAILED".to_string(),
                backup_file: None,
                incident_id,
            });
        };

        let file_name = newest.display().to_string();
        let mut failure: Option<String> = None;

        let size_kb = match fs::metadata(&newest) {
            Ok(meta) if meta.len() > 0 => meta.len() / 1024,
            Ok(_) => {
                failure = Some("backup dump is empty".to_string());
                0
            },
            Err(err) => {
                failure = Some(format!("cannot stat dump: {err}"));
                0
            },
        };
        let checksum = match checksum_file(&newest) {
            Ok(sum) => Some(sum),
            Err(err) => {
                failure.get_or_insert(format!("cannot checksum dump: {err}"));
                None
            },
        };

        let mut restore_tested = false;
        if failure.is_none() {
            if let Some(shadow) = &self.shadow_db_url {
                match restore_test(&newest, shadow) {
                    Ok(()) => restore_tested = true,
                    Err(err) => {
                        failure = Some(format!("restore test failed: {err}"));
                    },
                }
            }
        }

        let (status, incident_id) = match &failure {
            None => ("PASSED".to_string(), None),
            Some(reason) => {
                let id = self.open_failure_incident(reason);
                ("FAILED".to_string(), id)
            },
        };

        self.storage.insert_backup_validation(&BackupValidationRow {
            id: Uuid::new_v4().to_string(),
            backup_file: file_name.clone(),
            size_kb,
            checksum,
            restore_tested,
            drift_clean,
            incident_id: incident_id.clone(),
            validated_at: now,
            status: status.clone(),
        })?;
        self.registry.increment(if status == "PASSED" {
            "backup.validations_passed"
        } else {
            "backup.validations_failed"
        });
        info!(file = %file_name, status, restore_tested, "backup validated");
        Ok(ValidationOutcome {
            status,
            backup_file: Some(file_name),
            incident_id,
        })
    }

    fn open_failure_incident(&self, reason: &str) -> Option<String> {
        match self.incidents.create_incident(IncidentSpec {
            priority: IncidentPriority::P1,
            title: "Backup validation failed".to_string(),
            invariant: None,
            details: json!({ "reason": reason }),
        }) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "failed to open backup incident");
                None
            },
        }
    }
}

/// Newest regular file in `dir` by modification time.
fn newest_file(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), modified))
        })
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path)
}

/// SHA-256 of the file contents, hex-encoded.
fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Restore test: copy the dump to the shadow location and verify it opens
/// as a consistent database.
fn restore_test(dump: &Path, shadow_path: &str) -> Result<(), String> {
    fs::copy(dump, shadow_path).map_err(|e| e.to_string())?;
    let conn = rusqlite::Connection::open_with_flags(
        shadow_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| e.to_string())?;
    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if verdict == "ok" {
        Ok(())
    } else {
        Err(format!("integrity check answered {verdict}"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::alert::AlertDispatcher;
    use crate::clock::ManualClock;
    use crate::config::Transports;

    fn validator(dir: &Path, shadow: Option<String>) -> (BackupValidator, Storage) {
        let storage = Storage::open_in_memory().expect("storage");
        let registry = Arc::new(MetricsRegistry::new());
        let clock = Arc::new(ManualClock::new(50_000_000));
        let (alerts, _worker) = AlertDispatcher::new(Transports::default(), Arc::clone(&registry));
        let incidents = Arc::new(IncidentManager::new(
            storage.clone(),
            alerts,
            Arc::clone(&clock) as SharedClock,
            Arc::clone(&registry),
        ));
        let validator = BackupValidator::new(
            storage.clone(),
            incidents,
            clock as SharedClock,
            registry,
            dir,
            shadow,
        );
        (validator, storage)
    }

    #[test]
    fn missing_dump_fails_and_opens_p1() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (validator, storage) = validator(dir.path(), None);
        let outcome = validator.run_validation().expect("run");
        assert_eq!(outcome.status, "FAILED");
        assert!(outcome.incident_id.is_some());
        assert_eq!(storage.open_incident_counts().expect("counts").p1, 1);
        // The row is persisted FAILED and never counts as a passed backup.
        assert!(storage.latest_passed_backup().expect("query").is_none());
    }

    #[test]
    fn healthy_dump_passes_with_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("dump-1.db"), b"not empty").expect("write");
        let (validator, storage) = validator(dir.path(), None);
        storage
            .insert_drift_score(95, &json!({}), 49_000_000)
            .expect("drift");

        let outcome = validator.run_validation().expect("run");
        assert_eq!(outcome.status, "PASSED");
        assert!(outcome.incident_id.is_none());
        assert_eq!(storage.latest_passed_backup().expect("query"), Some(50_000_000));
    }

    #[test]
    fn empty_dump_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("dump-empty.db"), b"").expect("write");
        let (validator, storage) = validator(dir.path(), None);
        let outcome = validator.run_validation().expect("run");
        assert_eq!(outcome.status, "FAILED");
        assert_eq!(storage.open_incident_counts().expect("counts").p1, 1);
    }

    #[test]
    fn restore_test_against_shadow_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A real SQLite file is a valid dump for the restore test.
        let dump_path = dir.path().join("dump.db");
        {
            let conn = rusqlite::Connection::open(&dump_path).expect("create dump");
            conn.execute_batch("CREATE TABLE t (x); INSERT INTO t VALUES (1);")
                .expect("populate");
        }
        let shadow = dir.path().join("shadow.db");
        let (validator, _storage) = validator(
            dir.path(),
            Some(shadow.to_string_lossy().into_owned()),
        );
        let outcome = validator.run_validation().expect("run");
        assert_eq!(outcome.status, "PASSED");
    }
}
