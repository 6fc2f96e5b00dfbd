//! Reconciliation loop primitives.
//!
//! This library provides the scheduling side of a level-triggered
//! reconciliation loop. Key concepts:
//!
//! - **Action**: what a reconcile pass asks of the scheduler once it
//!   succeeds (requeue after a delay, or wait for the next change).
//! - **Backoff**: how long a failing key waits before its next attempt.
//! - **Work queue**: deduplicated, delayed delivery of keys to workers, with
//!   at most one in-flight pass per key.
//!
//! # Invariants
//!
//! - A key is handed to at most one worker at a time
//! - A key queued more than once is delivered once, at its earliest deadline
//! - Failure counts only grow until the key is forgotten

mod queue;

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use rand::Rng;

pub use queue::WorkQueue;

/// Scheduling directive returned by a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the same key again after `duration`, even without changes.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until the next change notification for the key.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Returns the requested requeue delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    ///
    /// The result never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(max_ms);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max_ms) as u64)
    }
}

/// Consecutive failure counts per key.
#[derive(Debug, Clone)]
pub struct FailureTracker<K> {
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash> FailureTracker<K> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns the number of consecutive failures including this one.
    pub fn record_failure(&mut self, key: K) -> u32 {
        let count = self.failures.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Number of consecutive failures recorded for a key.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for a key (on success).
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

impl<K: Eq + Hash> Default for FailureTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Default requeue interval after a successful pass.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between full resyncs of every record.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default backoff base delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_action_requeue() {
        let action = Action::requeue(DEFAULT_RECONCILE_INTERVAL);
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        assert_eq!(Action::await_change().requeue_after(), None);
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.5,
        };

        assert!(policy.delay(10) <= Duration::from_secs(5));
        assert!(policy.delay(u32::MAX) <= Duration::from_secs(5));
    }

    #[test]
    fn test_failure_tracker() {
        let mut tracker = FailureTracker::new();

        assert_eq!(tracker.record_failure("scaler-1"), 1);
        assert_eq!(tracker.record_failure("scaler-1"), 2);
        assert_eq!(tracker.failures(&"scaler-1"), 2);
        assert_eq!(tracker.failures(&"scaler-2"), 0);

        tracker.forget(&"scaler-1");
        assert_eq!(tracker.failures(&"scaler-1"), 0);
    }

    proptest! {
        #[test]
        fn prop_backoff_within_bounds(
            base_ms in 1u64..1_000,
            max_ms in 1u64..60_000,
            jitter in 0.0f64..1.0,
            attempt in 0u32..64,
        ) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
                jitter,
            };
            prop_assert!(policy.delay(attempt) <= policy.max);
        }
    }
}
