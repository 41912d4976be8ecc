//! Durable request deduplication with in-flight locking.
//!
//! `execute(key, handler)` guarantees at most one handler invocation per
//! live key across all callers and processes sharing the store:
//!
//! 1. A live unlocked record is a cache hit; the stored response returns.
//! 2. A live locked record means another caller is executing; this caller
//!    polls until the record unlocks, bounded by a maximum wait.
//! 3. Otherwise the caller races an `INSERT ... ON CONFLICT DO NOTHING`
//!    claim; the loser re-enters the loop on the waiting branch.
//! 4. Handler success stores the response and unlocks; handler failure
//!    deletes the row so a later retry can run. The handler's error always
//!    propagates.
//!
//! A second façade marks business actions with short-TTL `dup:` keys so
//! duplicate submissions inside a window can be flagged before execution.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_core::metrics::MetricsRegistry;
use thiserror::Error;
use tracing::debug;

use crate::clock::SharedClock;
use crate::storage::{Storage, StorageError};

/// Default record TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Poll interval while another caller holds the lock.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on waiting for another caller before giving up.
pub const MAX_WAIT: Duration = Duration::from_secs(30);

/// TTL for duplicate-transaction markers.
pub const DUP_MARKER_TTL: Duration = Duration::from_secs(5 * 60);

/// Boxed handler error.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Response a wrapped handler produces.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    /// HTTP status code to replay.
    pub status_code: u16,
    /// JSON body to replay.
    pub body: serde_json::Value,
}

/// Outcome of an idempotent execution.
#[derive(Debug, Clone)]
pub struct IdempotentOutcome {
    /// Stored or fresh status code.
    pub status_code: u16,
    /// Stored or fresh body.
    pub body: serde_json::Value,
    /// `true` when the response came from the registry, not the handler.
    pub cached: bool,
}

/// Errors surfaced by the registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdempotencyError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Another caller held the key past the maximum wait.
    #[error("idempotency key busy: {key}")]
    Busy {
        /// The contended key.
        key: String,
    },

    /// The wrapped handler failed; the key has been freed.
    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),
}

/// Durable idempotency registry.
pub struct IdempotencyRegistry {
    storage: Storage,
    clock: SharedClock,
    registry: Arc<MetricsRegistry>,
    ttl: Duration,
    wait_poll: Duration,
    max_wait: Duration,
}

impl IdempotencyRegistry {
    /// Creates a registry with the default TTL and wait bounds.
    #[must_use]
    pub fn new(storage: Storage, clock: SharedClock, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            storage,
            clock,
            registry,
            ttl: DEFAULT_TTL,
            wait_poll: WAIT_POLL_INTERVAL,
            max_wait: MAX_WAIT,
        }
    }

    /// Overrides the record TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides the waiting-branch poll interval and bound.
    #[must_use]
    pub const fn with_wait(mut self, poll: Duration, max_wait: Duration) -> Self {
        self.wait_poll = poll;
        self.max_wait = max_wait;
        self
    }

    /// Runs `handler` at most once per live `key`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Busy`] when another caller held the key
    /// past the maximum wait, [`IdempotencyError::Handler`] when the
    /// handler itself failed (after freeing the key), or a storage error.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        handler: F,
    ) -> Result<IdempotentOutcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerResponse, HandlerError>>,
    {
        let wait_started = Instant::now();
        loop {
            let now = self.clock.now_ms();
            if let Some(row) = self.storage.idempotency_find_live(key, now)? {
                if !row.locked {
                    self.registry.increment("idempotency.cache_hits");
                    debug!(key, "idempotent replay");
                    return Ok(IdempotentOutcome {
                        status_code: row.status_code.unwrap_or(200),
                        body: row.response_body.unwrap_or(serde_json::Value::Null),
                        cached: true,
                    });
                }
                // Another caller is executing. Wait, bounded.
                if wait_started.elapsed() >= self.max_wait {
                    self.registry.increment("idempotency.busy");
                    return Err(IdempotencyError::Busy {
                        key: key.to_string(),
                    });
                }
                tokio::time::sleep(self.wait_poll).await;
                continue;
            }

            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            let ttl_ms = self.ttl.as_millis() as i64;
            if self.storage.idempotency_try_lock(key, now, ttl_ms)? {
                break;
            }
            // Lost the insert race, or an expired row still occupies the
            // key. Clear the latter and re-enter the loop.
            self.storage.idempotency_delete_expired(key, now)?;
        }

        match handler().await {
            Ok(response) => {
                self.storage
                    .idempotency_complete(key, response.status_code, &response.body)?;
                self.registry.increment("idempotency.executions");
                Ok(IdempotentOutcome {
                    status_code: response.status_code,
                    body: response.body,
                    cached: false,
                })
            },
            Err(err) => {
                // Free the key so a later retry can run.
                self.storage.idempotency_delete(key)?;
                self.registry.increment("idempotency.handler_failures");
                Err(IdempotencyError::Handler(err))
            },
        }
    }

    /// Garbage-collects expired records. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn gc(&self) -> Result<usize, StorageError> {
        let deleted = self.storage.idempotency_gc(self.clock.now_ms())?;
        if deleted > 0 {
            debug!(deleted, "idempotency records collected");
        }
        self.registry
            .increment_by("idempotency.gc_deleted", deleted as u64);
        Ok(deleted)
    }

    /// Marks a business action for duplicate detection.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn record_transaction_marker(&self, business_key: &str) -> Result<(), StorageError> {
        let now = self.clock.now_ms();
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let ttl_ms = DUP_MARKER_TTL.as_millis() as i64;
        let key = format!("dup:{business_key}:{now}");
        self.storage.idempotency_try_lock(&key, now, ttl_ms)?;
        // Markers carry no response; unlock immediately so they read as
        // completed records.
        self.storage
            .idempotency_complete(&key, 200, &serde_json::Value::Null)?;
        Ok(())
    }

    /// Whether the business action was already marked inside `window`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn is_duplicate_transaction(
        &self,
        business_key: &str,
        window: Duration,
    ) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let window_ms = window.as_millis() as i64;
        self.storage.idempotency_prefix_exists(
            &format!("dup:{business_key}:"),
            now - window_ms,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn registry() -> (Arc<IdempotencyRegistry>, Storage, Arc<ManualClock>) {
        let storage = Storage::open_in_memory().expect("storage");
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = IdempotencyRegistry::new(
            storage.clone(),
            Arc::clone(&clock) as SharedClock,
            Arc::new(MetricsRegistry::new()),
        )
        .with_wait(Duration::from_millis(10), Duration::from_millis(300));
        (Arc::new(registry), storage, clock)
    }

    fn ok_response(id: &str) -> Result<HandlerResponse, HandlerError> {
        Ok(HandlerResponse {
            status_code: 201,
            body: json!({ "id": id }),
        })
    }

    #[tokio::test]
    async fn first_call_executes_second_replays() {
        let (registry, _storage, _clock) = registry();
        let calls = AtomicU32::new(0);

        let first = registry
            .execute("K1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                ok_response("A")
            })
            .await
            .expect("first");
        assert!(!first.cached);
        assert_eq!(first.status_code, 201);
        assert_eq!(first.body["id"], "A");

        let second = registry
            .execute("K1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                ok_response("B")
            })
            .await
            .expect("second");
        assert!(second.cached);
        // The first result replays; the second handler never ran.
        assert_eq!(second.body["id"], "A");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_invoke_the_handler_once() {
        let (registry, _storage, _clock) = registry();
        let calls = Arc::new(AtomicU32::new(0));

        let a = {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                registry
                    .execute("K1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        ok_response("A")
                    })
                    .await
            })
        };
        let b = {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                registry
                    .execute("K1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        ok_response("A")
                    })
                    .await
            })
        };

        let a = a.await.expect("join").expect("a");
        let b = b.await.expect("join").expect("b");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Exactly one caller executed; both see the same body.
        assert_ne!(a.cached, b.cached);
        assert_eq!(a.body["id"], "A");
        assert_eq!(b.body["id"], "A");
    }

    #[tokio::test]
    async fn handler_failure_frees_the_key() {
        let (registry, _storage, _clock) = registry();
        let outcome = registry
            .execute("K1", || async {
                Err::<HandlerResponse, HandlerError>("boom".into())
            })
            .await;
        assert!(matches!(outcome, Err(IdempotencyError::Handler(_))));

        // The key is free for a retry that succeeds.
        let retried = registry
            .execute("K1", || async { ok_response("after-retry") })
            .await
            .expect("retry");
        assert!(!retried.cached);
        assert_eq!(retried.body["id"], "after-retry");
    }

    #[tokio::test]
    async fn stuck_lock_answers_busy_after_the_bound() {
        let (registry, storage, _clock) = registry();
        // Simulate a caller that locked and died without completing.
        assert!(storage
            .idempotency_try_lock("K1", 1_000_000, 86_400_000)
            .expect("lock"));

        let outcome = registry
            .execute("K1", || async { ok_response("never") })
            .await;
        assert!(matches!(
            outcome,
            Err(IdempotencyError::Busy { key }) if key == "K1"
        ));
    }

    #[tokio::test]
    async fn expired_record_is_cleared_and_reclaimed() {
        let (registry, storage, clock) = registry();
        assert!(storage
            .idempotency_try_lock("K1", 1_000_000, 1_000)
            .expect("lock"));
        // Past the TTL the stale row no longer blocks execution.
        clock.advance_ms(2_000);
        let outcome = registry
            .execute("K1", || async { ok_response("fresh") })
            .await
            .expect("execute");
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn gc_removes_expired_rows() {
        let (registry, storage, clock) = registry();
        registry
            .execute("K1", || async { ok_response("A") })
            .await
            .expect("execute");
        assert_eq!(registry.gc().expect("gc"), 0);
        clock.advance_ms(25 * 60 * 60 * 1000);
        assert_eq!(registry.gc().expect("gc"), 1);
        assert!(storage
            .idempotency_find_live("K1", clock.now_ms())
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_transaction_window() {
        let (registry, _storage, clock) = registry();
        assert!(!registry
            .is_duplicate_transaction("order-42", Duration::from_secs(60))
            .expect("query"));
        registry
            .record_transaction_marker("order-42")
            .expect("marker");
        assert!(registry
            .is_duplicate_transaction("order-42", Duration::from_secs(60))
            .expect("query"));
        // Outside the window the marker no longer matches.
        clock.advance_ms(2 * 60 * 1000);
        assert!(!registry
            .is_duplicate_transaction("order-42", Duration::from_secs(60))
            .expect("query"));
    }
}
