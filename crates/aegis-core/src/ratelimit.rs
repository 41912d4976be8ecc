//! Sliding-window request rate limiter.
//!
//! Per key (typically `ip:<addr>`), the limiter keeps a deque of request
//! timestamps inside the window. Each request slides the window, appends the
//! new timestamp, and blocks the key for the configured duration once the
//! count exceeds the limit. Blocked keys are rejected without recording
//! further timestamps, so the block expires on schedule regardless of the
//! caller's persistence.
//!
//! Timestamps are caller-supplied unix milliseconds, which keeps the window
//! arithmetic deterministic under test.
//!
//! # Memory Management
//!
//! Two defenses bound memory against key-spoofing: periodic [`cleanup`]
//! (driven by the scheduler) drops windows idle for longer than twice the
//! window, and a hard cap on tracked keys refuses new entries once reached
//! (counting the refusal as a rejection, which fails closed).
//!
//! [`cleanup`]: SlidingWindowLimiter::cleanup
//!
//! # Thread Safety
//!
//! All state sits behind one `RwLock`; handlers running concurrently contend
//! only for the short bookkeeping section.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

/// Hard cap on tracked keys.
pub const MAX_TRACKED_KEYS: usize = 10_000;

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests allowed inside the window.
    pub limit: u32,
    /// Sliding window size.
    pub window: Duration,
    /// How long a key stays blocked after exceeding the limit.
    pub block_duration: Duration,
    /// Hard cap on tracked keys.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
            max_tracked_keys: MAX_TRACKED_KEYS,
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request admitted.
    Allowed,
    /// Request rejected; the key is blocked until the given unix-ms instant.
    Blocked {
        /// When the block lapses (unix milliseconds).
        until_ms: i64,
    },
}

impl RateLimitDecision {
    /// Returns `true` for [`RateLimitDecision::Allowed`].
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Default)]
struct KeyWindow {
    timestamps: VecDeque<i64>,
    blocked_until_ms: Option<i64>,
    last_seen_ms: i64,
}

/// Sliding-window limiter keyed by opaque strings.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    windows: RwLock<HashMap<String, KeyWindow>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Records a request for `key` at `now_ms` and decides whether to admit
    /// it.
    pub fn check(&self, key: &str, now_ms: i64) -> RateLimitDecision {
        let mut windows = self.windows.write().expect("limiter lock poisoned");

        if !windows.contains_key(key) && windows.len() >= self.config.max_tracked_keys {
            // At capacity: try reclaiming idle windows before refusing.
            let idle_cutoff = now_ms - 2 * window_ms(&self.config);
            windows.retain(|_, w| w.last_seen_ms >= idle_cutoff || w.blocked_until_ms.is_some());
            if windows.len() >= self.config.max_tracked_keys {
                return RateLimitDecision::Blocked {
                    until_ms: now_ms + block_ms(&self.config),
                };
            }
        }

        let window = windows.entry(key.to_string()).or_default();
        window.last_seen_ms = now_ms;

        if let Some(until) = window.blocked_until_ms {
            if until > now_ms {
                return RateLimitDecision::Blocked { until_ms: until };
            }
            window.blocked_until_ms = None;
            window.timestamps.clear();
        }

        let cutoff = now_ms - window_ms(&self.config);
        while window.timestamps.front().is_some_and(|&t| t <= cutoff) {
            window.timestamps.pop_front();
        }
        window.timestamps.push_back(now_ms);

        if window.timestamps.len() > self.config.limit as usize {
            let until = now_ms + block_ms(&self.config);
            window.blocked_until_ms = Some(until);
            return RateLimitDecision::Blocked { until_ms: until };
        }
        RateLimitDecision::Allowed
    }

    /// Returns `true` if `key` is currently blocked, without recording a
    /// request.
    #[must_use]
    pub fn is_blocked(&self, key: &str, now_ms: i64) -> bool {
        self.windows
            .read()
            .expect("limiter lock poisoned")
            .get(key)
            .and_then(|w| w.blocked_until_ms)
            .is_some_and(|until| until > now_ms)
    }

    /// Drops windows with no requests newer than twice the window size.
    /// Returns the number of entries removed.
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let mut windows = self.windows.write().expect("limiter lock poisoned");
        let cutoff = now_ms - 2 * window_ms(&self.config);
        let before = windows.len();
        windows.retain(|_, w| {
            w.last_seen_ms >= cutoff || w.blocked_until_ms.is_some_and(|until| until > now_ms)
        });
        before - windows.len()
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.read().expect("limiter lock poisoned").len()
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn window_ms(config: &RateLimitConfig) -> i64 {
    config.window.as_millis() as i64
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn block_ms(config: &RateLimitConfig) -> i64 {
    config.block_duration.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig {
            limit,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn admits_up_to_limit_then_blocks() {
        let l = limiter(3);
        let now = 1_000_000;
        for i in 0..3 {
            assert!(l.check("ip:1.2.3.4", now + i).is_allowed());
        }
        let decision = l.check("ip:1.2.3.4", now + 3);
        assert_eq!(
            decision,
            RateLimitDecision::Blocked {
                until_ms: now + 3 + 300_000
            }
        );
    }

    #[test]
    fn window_slides_old_requests_out() {
        let l = limiter(2);
        let now = 1_000_000;
        assert!(l.check("k", now).is_allowed());
        assert!(l.check("k", now + 1).is_allowed());
        // 61 s later the old requests fall outside the window.
        assert!(l.check("k", now + 61_000).is_allowed());
    }

    #[test]
    fn blocked_requests_do_not_extend_the_block() {
        let l = limiter(1);
        let now = 1_000_000;
        assert!(l.check("k", now).is_allowed());
        let RateLimitDecision::Blocked { until_ms } = l.check("k", now + 1) else {
            panic!("expected block");
        };
        // Hammering while blocked neither extends nor resets.
        for i in 2..100 {
            assert_eq!(
                l.check("k", now + i),
                RateLimitDecision::Blocked { until_ms }
            );
        }
        assert!(l.is_blocked("k", until_ms - 1));
        // After the block expires the window restarts clean.
        assert!(l.check("k", until_ms + 1).is_allowed());
    }

    #[test]
    fn recorded_count_never_exceeds_limit_plus_one() {
        let l = limiter(5);
        let now = 1_000_000;
        let mut recorded = 0;
        for i in 0..50 {
            if l.check("k", now + i).is_allowed() {
                recorded += 1;
            } else {
                break;
            }
        }
        // The request that trips the limit is the (limit+1)th recorded one.
        assert_eq!(recorded, 5);
    }

    #[test]
    fn cleanup_drops_idle_windows() {
        let l = limiter(10);
        let now = 1_000_000;
        l.check("a", now);
        l.check("b", now);
        assert_eq!(l.tracked_keys(), 2);
        // Only "b" stays fresh.
        l.check("b", now + 119_000);
        assert_eq!(l.cleanup(now + 121_000), 1);
        assert_eq!(l.tracked_keys(), 1);
    }

    #[test]
    fn capacity_cap_fails_closed() {
        let l = SlidingWindowLimiter::new(RateLimitConfig {
            limit: 10,
            max_tracked_keys: 2,
            ..RateLimitConfig::default()
        });
        let now = 1_000_000;
        assert!(l.check("a", now).is_allowed());
        assert!(l.check("b", now).is_allowed());
        // A third fresh key cannot displace live windows.
        assert!(!l.check("c", now).is_allowed());
    }
}
