//! Retry backoff policies and failure classification.
//!
//! Two policies cover the control plane's transient-failure surface:
//!
//! - [`RetryPolicy::deadlock`] for storage conflicts (serialization
//!   failures, deadlocks, lock timeouts): 5 attempts, base 50 ms, capped at
//!   2 s, uniform jitter up to 50 ms.
//! - [`RetryPolicy::network`] for transport failures (connection refused,
//!   timeout, reset): 4 attempts, base 200 ms, capped at 5 s.
//!
//! Delay for attempt `n` (1-based) is `base * 2^(n-1)` capped, plus uniform
//! jitter. Classification is message-based because the storage and transport
//! layers surface conflicts as stringly-typed driver errors; anything not
//! recognized propagates unchanged. A rejected-by-breaker failure is never
//! retryable.

use std::time::Duration;

use rand::Rng;

/// Default jitter ceiling added to every computed backoff delay.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(50);

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Ceiling applied to the exponential delay (before jitter).
    pub max_delay: Duration,
    /// Uniform random jitter added on top of each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy for storage serialization conflicts.
    #[must_use]
    pub const fn deadlock() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Policy for transport-level failures.
    #[must_use]
    pub const fn network() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Backoff before retry `attempt` (1-based: attempt 1 is the first
    /// retry). Exponential, capped, without jitter.
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }

    /// Backoff before retry `attempt` with uniform jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Returns `true` when an error message indicates a retryable storage
/// conflict (deadlock, serialization failure, lock timeout).
#[must_use]
pub fn is_serialization_conflict(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("deadlock")
        || lower.contains("serialization failure")
        || lower.contains("could not serialize")
        || lower.contains("lock timeout")
        || lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("busy")
}

/// Returns `true` when an error message indicates a retryable transport
/// failure (connection refused, timeout, reset).
#[must_use]
pub fn is_transport_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("broken pipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_backoff_schedule() {
        let policy = RetryPolicy::deadlock();
        assert_eq!(
            policy.base_delay_for_attempt(1),
            Duration::from_millis(50)
        );
        assert_eq!(
            policy.base_delay_for_attempt(2),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.base_delay_for_attempt(3),
            Duration::from_millis(200)
        );
        assert_eq!(
            policy.base_delay_for_attempt(4),
            Duration::from_millis(400)
        );
        // Attempt 7 would be 3200 ms; the cap holds it at 2 s.
        assert_eq!(policy.base_delay_for_attempt(7), Duration::from_secs(2));
    }

    #[test]
    fn network_backoff_capped_at_five_seconds() {
        let policy = RetryPolicy::network();
        assert_eq!(
            policy.base_delay_for_attempt(1),
            Duration::from_millis(200)
        );
        assert_eq!(policy.base_delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_bounded() {
        let policy = RetryPolicy::deadlock();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn conflict_classification() {
        assert!(is_serialization_conflict("ERROR: deadlock detected"));
        assert!(is_serialization_conflict("database is locked"));
        assert!(is_serialization_conflict("Lock timeout exceeded"));
        assert!(is_serialization_conflict(
            "could not serialize access due to concurrent update"
        ));
        assert!(!is_serialization_conflict("syntax error at or near"));
        assert!(!is_serialization_conflict("connection refused"));
    }

    #[test]
    fn transport_classification() {
        assert!(is_transport_failure("connection refused"));
        assert!(is_transport_failure("operation timed out"));
        assert!(is_transport_failure("Connection reset by peer"));
        assert!(!is_transport_failure("404 not found"));
    }
}
