//! Retry wrappers over the backoff policies.
//!
//! [`with_deadlock_retry`] re-runs an operation whose failure looks like a
//! storage serialization conflict (deadlock, lock timeout, busy database);
//! anything else propagates unchanged. [`with_network_retry`] does the
//! same for transport failures, behind a circuit breaker — a rejected
//! breaker is terminal, never retried.
//!
//! Both wrappers publish retry counters so exhaustion shows up on the
//! dashboards before it shows up in the error rate.

use std::future::Future;
use std::sync::Arc;

use aegis_core::breaker::{BreakerError, CircuitBreaker};
use aegis_core::metrics::MetricsRegistry;
use aegis_core::retry::{is_serialization_conflict, is_transport_failure, RetryPolicy};
use thiserror::Error;
use tracing::debug;

/// Failure of a breaker-guarded network operation.
#[derive(Debug, Error)]
pub enum NetworkRetryError<E> {
    /// The breaker rejected the call without running it.
    #[error(transparent)]
    BreakerOpen(BreakerError),
    /// The operation itself failed (after exhausting any retries).
    #[error(transparent)]
    Inner(E),
}

/// Runs `op`, retrying storage serialization conflicts with the deadlock
/// backoff policy. Non-conflict failures propagate unchanged.
///
/// # Errors
///
/// Returns the operation's own error once it is non-retryable or retries
/// are exhausted.
pub async fn with_deadlock_retry<T, E, F, Fut>(
    registry: &Arc<MetricsRegistry>,
    op: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let policy = RetryPolicy::deadlock();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_serialization_conflict(&err.to_string()) {
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    registry.increment("db.deadlock_retry.exhausted");
                    return Err(err);
                }
                registry.increment("db.deadlock_retry.count");
                debug!(attempt, error = %err, "retrying storage conflict");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            },
        }
    }
}

/// Runs `op` through `breaker`, retrying transport failures with the
/// network backoff policy. A breaker rejection is returned immediately and
/// never retried.
///
/// # Errors
///
/// Returns [`NetworkRetryError::BreakerOpen`] when the breaker rejects, or
/// [`NetworkRetryError::Inner`] once the operation's failure is
/// non-retryable or retries are exhausted.
pub async fn with_network_retry<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    registry: &Arc<MetricsRegistry>,
    op: F,
) -> Result<T, NetworkRetryError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let policy = RetryPolicy::network();
    let mut attempt = 1;
    loop {
        breaker.acquire().map_err(NetworkRetryError::BreakerOpen)?;
        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            },
            Err(err) => {
                breaker.record_failure();
                if !is_transport_failure(&err.to_string()) || attempt >= policy.max_attempts {
                    if attempt >= policy.max_attempts {
                        registry.increment("net.retry.exhausted");
                    }
                    return Err(NetworkRetryError::Inner(err));
                }
                registry.increment("net.retry.count");
                debug!(attempt, error = %err, "retrying transport failure");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use aegis_core::breaker::BreakerConfig;

    use super::*;

    #[tokio::test]
    async fn deadlock_retry_recovers_after_transient_conflicts() {
        let registry = Arc::new(MetricsRegistry::new());
        let attempts = AtomicU32::new(0);
        let result: Result<&str, String> = with_deadlock_retry(&registry, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("ERROR: deadlock detected".to_string())
                } else {
                    Ok("committed")
                }
            }
        })
        .await;
        assert_eq!(result.expect("success"), "committed");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(registry.counter("db.deadlock_retry.count"), 2);
        assert_eq!(registry.counter("db.deadlock_retry.exhausted"), 0);
    }

    #[tokio::test]
    async fn non_conflict_failures_propagate_immediately() {
        let registry = Arc::new(MetricsRegistry::new());
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = with_deadlock_retry(&registry, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("syntax error at or near SELECT".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.counter("db.deadlock_retry.count"), 0);
    }

    #[tokio::test]
    async fn deadlock_retry_exhaustion_surfaces_the_error() {
        let registry = Arc::new(MetricsRegistry::new());
        let result: Result<(), String> = with_deadlock_retry(&registry, || async {
            Err("database is locked".to_string())
        })
        .await;
        assert_eq!(result.expect_err("exhausted"), "database is locked");
        assert_eq!(registry.counter("db.deadlock_retry.count"), 4);
        assert_eq!(registry.counter("db.deadlock_retry.exhausted"), 1);
    }

    #[tokio::test]
    async fn network_retry_stops_at_breaker_open() {
        let registry = Arc::new(MetricsRegistry::new());
        let breaker = CircuitBreaker::new(
            "webhook",
            BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(30),
                half_open_probes: 2,
            },
            Arc::clone(&registry),
        );
        // Two connection failures open the breaker mid-retry; the wrapper
        // then reports BreakerOpen instead of hammering the endpoint.
        let result: Result<(), NetworkRetryError<String>> =
            with_network_retry(&breaker, &registry, || async {
                Err("connection refused".to_string())
            })
            .await;
        assert!(matches!(result, Err(NetworkRetryError::BreakerOpen(_))));
        assert_eq!(registry.counter("net.retry.count"), 2);
    }

    #[tokio::test]
    async fn network_retry_recovers_after_a_timeout() {
        let registry = Arc::new(MetricsRegistry::new());
        let breaker = CircuitBreaker::new(
            "webhook",
            BreakerConfig::default(),
            Arc::clone(&registry),
        );
        let attempts = AtomicU32::new(0);
        let result: Result<&str, NetworkRetryError<String>> =
            with_network_retry(&breaker, &registry, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("operation timed out".to_string())
                    } else {
                        Ok("delivered")
                    }
                }
            })
            .await;
        assert_eq!(result.expect("success"), "delivered");
        assert_eq!(registry.counter("net.retry.count"), 1);
    }
}
