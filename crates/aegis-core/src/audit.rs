//! Tamper-evident audit chain hashing and continuity verification.
//!
//! Every audit entry carries a `row_hash` computed at insertion time and a
//! `prev_hash` pointing at the immediately preceding entry (the sentinel
//! `GENESIS` for the first). The hash is bit-exact SHA-256 over the
//! concatenation of `prev_hash`, id, action, entity type, entity id, and
//! the creation timestamp rendered as decimal text, hex-encoded. The
//! verifier checks continuity only; it never recomputes row hashes, so
//! historical chains stay verifiable even if the hashed field set grows.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel `prev_hash` of the first chain entry.
pub const GENESIS_HASH: &str = "GENESIS";

/// One entry of the audit chain, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id.
    pub id: String,
    /// Action recorded (`sale.confirm`, `stock.adjust`, ...).
    pub action: String,
    /// Kind of the touched entity.
    pub entity_type: String,
    /// Identifier of the touched entity.
    pub entity_id: String,
    /// Hash of this row.
    pub row_hash: String,
    /// Hash of the preceding row, or [`GENESIS_HASH`].
    pub prev_hash: String,
    /// Creation time, unix milliseconds.
    pub created_at_ms: i64,
}

/// Computes a row hash over the audit fields.
///
/// The timestamp is rendered as decimal text so the digest is
/// locale-independent and reproducible from the stored column.
#[must_use]
pub fn compute_row_hash(
    prev_hash: &str,
    id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    created_at_ms: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(id.as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(entity_type.as_bytes());
    hasher.update(entity_id.as_bytes());
    hasher.update(created_at_ms.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    /// `true` when every checked link held.
    pub valid: bool,
    /// Id of the first entry whose `prev_hash` broke continuity.
    pub broken_at: Option<String>,
    /// Hash continuity expected at the break.
    pub expected: Option<String>,
    /// Hash actually stored at the break.
    pub actual: Option<String>,
    /// Entries examined.
    pub checked: usize,
}

impl ChainVerification {
    fn ok(checked: usize) -> Self {
        Self {
            valid: true,
            broken_at: None,
            expected: None,
            actual: None,
            checked,
        }
    }
}

/// Verifies `prev_hash` continuity over entries ordered by creation time.
///
/// The first entry must point at [`GENESIS_HASH`]; each later entry must
/// point at its predecessor's `row_hash`. Verification stops at the first
/// mismatch.
#[must_use]
pub fn verify_chain(entries: &[AuditEntry]) -> ChainVerification {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (index, entry) in entries.iter().enumerate() {
        if entry.prev_hash != expected_prev {
            return ChainVerification {
                valid: false,
                broken_at: Some(entry.id.clone()),
                expected: Some(expected_prev),
                actual: Some(entry.prev_hash.clone()),
                checked: index + 1,
            };
        }
        expected_prev = entry.row_hash.clone();
    }
    ChainVerification::ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, prev_hash: &str, at_ms: i64) -> AuditEntry {
        let row_hash = compute_row_hash(prev_hash, id, "sale.confirm", "sale", "s-1", at_ms);
        AuditEntry {
            id: id.to_string(),
            action: "sale.confirm".to_string(),
            entity_type: "sale".to_string(),
            entity_id: "s-1".to_string(),
            row_hash,
            prev_hash: prev_hash.to_string(),
            created_at_ms: at_ms,
        }
    }

    fn chain_of(len: usize) -> Vec<AuditEntry> {
        let mut entries = Vec::new();
        let mut prev = GENESIS_HASH.to_string();
        for i in 0..len {
            let e = entry(&format!("a{i}"), &prev, 1_000 + i as i64);
            prev = e.row_hash.clone();
            entries.push(e);
        }
        entries
    }

    #[test]
    fn row_hash_is_deterministic_hex_sha256() {
        let h1 = compute_row_hash(GENESIS_HASH, "a1", "act", "sale", "s1", 1234);
        let h2 = compute_row_hash(GENESIS_HASH, "a1", "act", "sale", "s1", 1234);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        // Any field change changes the digest.
        assert_ne!(
            h1,
            compute_row_hash(GENESIS_HASH, "a1", "act", "sale", "s1", 1235)
        );
    }

    #[test]
    fn empty_chain_is_valid() {
        let verification = verify_chain(&[]);
        assert!(verification.valid);
        assert_eq!(verification.checked, 0);
    }

    #[test]
    fn intact_chain_verifies() {
        let entries = chain_of(5);
        let verification = verify_chain(&entries);
        assert!(verification.valid);
        assert_eq!(verification.checked, 5);
        assert!(verification.broken_at.is_none());
    }

    #[test]
    fn first_entry_must_point_at_genesis() {
        let mut entries = chain_of(3);
        entries[0].prev_hash = "deadbeef".to_string();
        let verification = verify_chain(&entries);
        assert!(!verification.valid);
        assert_eq!(verification.broken_at.as_deref(), Some("a0"));
        assert_eq!(verification.expected.as_deref(), Some(GENESIS_HASH));
    }

    #[test]
    fn tampered_middle_link_is_located() {
        let mut entries = chain_of(3);
        let expected = entries[0].row_hash.clone();
        entries[1].prev_hash = "0000".to_string();
        let verification = verify_chain(&entries);
        assert!(!verification.valid);
        assert_eq!(verification.broken_at.as_deref(), Some("a1"));
        assert_eq!(verification.expected.as_deref(), Some(expected.as_str()));
        assert_eq!(verification.actual.as_deref(), Some("0000"));
        assert_eq!(verification.checked, 2);
    }
}
