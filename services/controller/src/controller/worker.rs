//! Reconcile worker.
//!
//! Pulls keys from the work queue and turns each pass outcome into the
//! key's next schedule: the requested requeue on success, backoff on error.

use std::sync::Arc;

use appscaler_id::ObjectKey;
use appscaler_reconcile::WorkQueue;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::reconciler::AppScalerReconciler;
use super::shutdown_signaled;

/// A single reconcile worker.
pub struct Worker {
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<AppScalerReconciler>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<WorkQueue<ObjectKey>>,
        reconciler: Arc<AppScalerReconciler>,
    ) -> Self {
        Self {
            id,
            queue,
            reconciler,
        }
    }

    /// Process keys until the queue shuts down or shutdown is signaled.
    ///
    /// A pass still running at shutdown is dropped at its next store call.
    #[instrument(skip_all, fields(worker = self.id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker started");

        while let Some(key) = self.queue.next().await {
            let outcome = tokio::select! {
                result = self.reconciler.reconcile(&key) => Some(result),
                _ = shutdown_signaled(&mut shutdown) => None,
            };

            match outcome {
                Some(Ok(action)) => {
                    self.queue.forget(&key);
                    if let Some(delay) = action.requeue_after() {
                        self.queue.add_after(key.clone(), delay);
                    }
                }
                Some(Err(e)) => {
                    let delay = self.queue.add_rate_limited(key.clone());
                    let attempts = self.queue.num_requeues(&key);
                    if e.is_conflict() {
                        debug!(
                            scaler = %key,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Reconcile lost a write race, retrying"
                        );
                    } else {
                        warn!(
                            scaler = %key,
                            error = %e,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            "Reconcile failed, retrying with backoff"
                        );
                    }
                }
                None => {
                    info!(scaler = %key, "Reconcile cancelled by shutdown");
                    self.queue.done(&key);
                    break;
                }
            }

            self.queue.done(&key);
        }

        debug!("Worker stopped");
    }
}
