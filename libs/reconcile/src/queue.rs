//! Deduplicating delayed work queue.
//!
//! Keys are scheduled with a deadline and handed out to workers once the
//! deadline passes. A key that is already queued keeps the earliest of its
//! deadlines. A key that is in flight is never handed to a second worker;
//! re-adds while in flight are parked and released by [`WorkQueue::done`].

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::{BackoffPolicy, FailureTracker};

/// Work queue feeding reconcile workers.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

struct QueueState<K> {
    /// Keys waiting for their deadline.
    scheduled: HashMap<K, Instant>,

    /// Keys currently held by a worker.
    in_flight: HashSet<K>,

    /// Keys re-added while in flight, with their earliest deadline.
    parked: HashMap<K, Instant>,

    failures: FailureTracker<K>,

    shutdown: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    /// Create an empty queue using `backoff` for rate-limited adds.
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                scheduled: HashMap::new(),
                in_flight: HashSet::new(),
                parked: HashMap::new(),
                failures: FailureTracker::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queue a key for immediate processing.
    pub fn add(&self, key: K) {
        self.add_at(key, Instant::now());
    }

    /// Queue a key to become ready after `delay`.
    pub fn add_after(&self, key: K, delay: Duration) {
        self.add_at(key, Instant::now() + delay);
    }

    /// Queue a key after the backoff delay for its failure count, and count
    /// one more failure.
    ///
    /// Returns the delay that was applied.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = self.lock().failures.record_failure(key.clone());
        let delay = self.backoff.delay(attempt.saturating_sub(1));
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for a key.
    pub fn forget(&self, key: &K) {
        self.lock().failures.forget(key);
    }

    /// Number of consecutive rate-limited adds since the key was last
    /// forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.failures(key)
    }

    fn add_at(&self, key: K, deadline: Instant) {
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }

            let slot = if state.in_flight.contains(&key) {
                &mut state.parked
            } else {
                &mut state.scheduled
            };
            slot.entry(key)
                .and_modify(|existing| *existing = (*existing).min(deadline))
                .or_insert(deadline);
        }

        self.notify.notify_one();
    }

    /// Wait for the next ready key.
    ///
    /// The returned key is marked in flight until [`WorkQueue::done`] is
    /// called for it. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }

                let now = Instant::now();
                let ready = state
                    .scheduled
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .min_by_key(|(_, deadline)| **deadline)
                    .map(|(key, _)| key.clone());

                if let Some(key) = ready {
                    state.scheduled.remove(&key);
                    state.in_flight.insert(key.clone());
                    let more_ready = state.scheduled.values().any(|deadline| *deadline <= now);
                    drop(state);

                    if more_ready {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }

                state.scheduled.values().min().copied()
            };

            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key handed out by [`WorkQueue::next`].
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            match state.parked.remove(key) {
                Some(deadline) if !state.shutdown => {
                    state.scheduled.insert(key.clone(), deadline);
                    true
                }
                _ => false,
            }
        };

        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutdown = true;
            state.scheduled.clear();
            state.parked.clear();
        }
        debug!("Work queue shut down");
        self.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Number of keys waiting (scheduled or parked behind an in-flight pass).
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.scheduled.len() + state.parked.len()
    }

    /// Returns true if no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // State stays consistent across a panicking holder: every critical
        // section is a handful of map operations.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
