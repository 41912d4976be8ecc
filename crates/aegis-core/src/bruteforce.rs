//! Brute-force lockout detector for authentication failures.
//!
//! Per key (account id or `ip:<addr>`), failures are tracked inside a
//! rolling window; hitting the failure threshold locks the key for the
//! configured duration. A recorded success clears the entry entirely.
//!
//! Timestamps are caller-supplied unix milliseconds, like the rate limiter,
//! so the window arithmetic stays deterministic under test.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct BruteForceConfig {
    /// Failures inside the window before the key locks.
    pub max_failures: u32,
    /// Rolling window failures are counted in.
    pub window: Duration,
    /// How long a key stays locked.
    pub lockout: Duration,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            window: Duration::from_secs(15 * 60),
            lockout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct FailureEntry {
    failures: VecDeque<i64>,
    locked_until_ms: Option<i64>,
}

/// Failure-window lockout detector.
pub struct BruteForceDetector {
    config: BruteForceConfig,
    entries: RwLock<HashMap<String, FailureEntry>>,
}

impl BruteForceDetector {
    /// Creates a detector with the given configuration.
    #[must_use]
    pub fn new(config: BruteForceConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Records a failed attempt. Returns `true` if the key is now locked.
    pub fn record_failure(&self, key: &str, now_ms: i64) -> bool {
        let mut entries = self.entries.write().expect("bruteforce lock poisoned");
        let entry = entries.entry(key.to_string()).or_default();

        if let Some(until) = entry.locked_until_ms {
            if until > now_ms {
                return true;
            }
            entry.locked_until_ms = None;
            entry.failures.clear();
        }

        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let cutoff = now_ms - self.config.window.as_millis() as i64;
        while entry.failures.front().is_some_and(|&t| t <= cutoff) {
            entry.failures.pop_front();
        }
        entry.failures.push_back(now_ms);

        if entry.failures.len() >= self.config.max_failures as usize {
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            let until = now_ms + self.config.lockout.as_millis() as i64;
            entry.locked_until_ms = Some(until);
            return true;
        }
        false
    }

    /// Clears all state for `key` after a successful attempt.
    pub fn record_success(&self, key: &str) {
        self.entries
            .write()
            .expect("bruteforce lock poisoned")
            .remove(key);
    }

    /// Returns `true` if `key` is currently locked.
    #[must_use]
    pub fn is_locked(&self, key: &str, now_ms: i64) -> bool {
        self.entries
            .read()
            .expect("bruteforce lock poisoned")
            .get(key)
            .and_then(|e| e.locked_until_ms)
            .is_some_and(|until| until > now_ms)
    }

    /// Drops unlocked entries whose failures have all aged out.
    pub fn cleanup(&self, now_ms: i64) {
        let mut entries = self.entries.write().expect("bruteforce lock poisoned");
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let cutoff = now_ms - self.config.window.as_millis() as i64;
        entries.retain(|_, e| {
            e.locked_until_ms.is_some_and(|until| until > now_ms)
                || e.failures.back().is_some_and(|&t| t > cutoff)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> BruteForceDetector {
        BruteForceDetector::new(BruteForceConfig::default())
    }

    #[test]
    fn locks_on_tenth_failure_in_window() {
        let d = detector();
        let now = 1_000_000;
        for i in 0..9 {
            assert!(!d.record_failure("user:42", now + i));
        }
        assert!(d.record_failure("user:42", now + 9));
        assert!(d.is_locked("user:42", now + 10));
        // Lock lasts 30 minutes.
        assert!(d.is_locked("user:42", now + 29 * 60 * 1000));
        assert!(!d.is_locked("user:42", now + 31 * 60 * 1000));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let d = detector();
        let now = 1_000_000;
        for i in 0..9 {
            d.record_failure("k", now + i);
        }
        // The 10th failure arrives after the first nine have aged out.
        assert!(!d.record_failure("k", now + 16 * 60 * 1000));
    }

    #[test]
    fn success_clears_the_entry() {
        let d = detector();
        let now = 1_000_000;
        for i in 0..9 {
            d.record_failure("k", now + i);
        }
        d.record_success("k");
        assert!(!d.record_failure("k", now + 9));
    }

    #[test]
    fn cleanup_retains_locked_entries() {
        let d = detector();
        let now = 1_000_000;
        for i in 0..10 {
            d.record_failure("locked", now + i);
        }
        d.record_failure("idle", now);
        d.cleanup(now + 16 * 60 * 1000);
        assert!(d.is_locked("locked", now + 16 * 60 * 1000));
        // Idle entry was dropped; its next failure starts a fresh window.
        assert!(!d.record_failure("idle", now + 16 * 60 * 1000));
    }
}
