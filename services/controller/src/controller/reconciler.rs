//! AppScaler reconciler.
//!
//! A single pass:
//! - Reads the AppScaler; a missing one is not an error
//! - Reads each target Workload in order, stopping at the first missing one
//! - Scales every Workload whose replica count differs from the desired one
//! - Records `Succeeded` if anything was scaled and the stored status differs
//!
//! The reconciler keeps no state between passes and never retries on its
//! own: every error goes back to the caller, which owns backoff.

use std::sync::Arc;
use std::time::Duration;

use appscaler_id::ObjectKey;
use appscaler_reconcile::Action;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::api::{AppScaler, AppScalerStatus, TargetError};
use crate::store::{ClusterStore, StoreError};

/// Errors returned by a reconcile pass. All of them are retryable.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A target Workload does not exist (yet).
    #[error("target {target} of {scaler} not found")]
    NotFoundTarget { scaler: ObjectKey, target: ObjectKey },

    /// A target was modified concurrently.
    #[error("write conflict: {0}")]
    WriteConflict(#[source] StoreError),

    /// The AppScaler status could not be written.
    #[error("failed to write status of {scaler}: {source}")]
    StatusWrite {
        scaler: ObjectKey,
        #[source]
        source: StoreError,
    },

    /// Any other store failure while reading or scaling a target.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl ReconcileError {
    /// Returns true if the pass lost an optimistic concurrency race.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::WriteConflict(_) => true,
            Self::StatusWrite { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Returns true if a Workload at `current` replicas must be scaled to
/// `desired`. Unset replicas always count as drift.
pub fn replicas_drifted(current: Option<u32>, desired: u32) -> bool {
    current != Some(desired)
}

/// Drives AppScaler targets to their desired replica count.
pub struct AppScalerReconciler {
    store: Arc<dyn ClusterStore>,
    requeue_interval: Duration,
    span: Span,
}

impl AppScalerReconciler {
    /// Create a reconciler.
    ///
    /// Every pass logs inside a child of `span`, tagged with the AppScaler
    /// key.
    pub fn new(store: Arc<dyn ClusterStore>, requeue_interval: Duration, span: Span) -> Self {
        Self {
            store,
            requeue_interval,
            span,
        }
    }

    /// Run one reconcile pass for an AppScaler.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let span = info_span!(parent: &self.span, "reconcile", scaler = %key);
        self.reconcile_scaler(key).instrument(span).await
    }

    async fn reconcile_scaler(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        debug!("Reconciling AppScaler");

        let scaler = match self.store.get_scaler(key).await {
            Ok(scaler) => scaler,
            Err(e) if e.is_not_found() => {
                debug!("AppScaler no longer exists, nothing to do");
                return Ok(Action::await_change());
            }
            Err(e) => {
                warn!(error = %e, "Failed to read AppScaler, skipping pass");
                return Ok(Action::requeue(self.requeue_interval));
            }
        };

        let desired = scaler.spec.replicas;
        debug!(
            replicas = desired,
            targets = scaler.spec.targets.len(),
            generation = scaler.metadata.generation,
            "Desired state"
        );

        let mut scaled = 0usize;
        for target in &scaler.spec.targets {
            let workload = match self.store.get_workload(target).await {
                Ok(workload) => workload,
                Err(e) if e.is_not_found() => {
                    warn!(workload = %target, "Target workload not found, aborting pass");
                    return Err(ReconcileError::NotFoundTarget {
                        scaler: key.clone(),
                        target: target.clone(),
                    });
                }
                Err(e) => return Err(ReconcileError::Store(e)),
            };

            let current = workload.spec.replicas;
            if !replicas_drifted(current, desired) {
                debug!(
                    workload = %target,
                    replicas = desired,
                    "Target already at desired replicas"
                );
                continue;
            }

            let mut update = workload;
            update.spec.replicas = Some(desired);

            match self.store.update_workload(&update).await {
                Ok(_) => {
                    info!(
                        workload = %target,
                        from = ?current,
                        to = desired,
                        "Scaled workload"
                    );
                    scaled += 1;
                }
                Err(e) if e.is_conflict() => {
                    debug!(workload = %target, error = %e, "Target modified concurrently");
                    return Err(ReconcileError::WriteConflict(e));
                }
                Err(e) if e.is_not_found() => {
                    warn!(workload = %target, "Target workload deleted during pass");
                    return Err(ReconcileError::NotFoundTarget {
                        scaler: key.clone(),
                        target: target.clone(),
                    });
                }
                Err(e) => {
                    warn!(workload = %target, error = %e, "Failed to scale workload");
                    let status = AppScalerStatus::failed(
                        scaler.metadata.generation,
                        scaled > 0,
                        TargetError {
                            target: target.clone(),
                            message: e.to_string(),
                        },
                    );
                    if let Err(status_err) = self.write_status(&scaler, status).await {
                        warn!(error = %status_err, "Failed to record failure status");
                    }
                    return Err(ReconcileError::Store(e));
                }
            }
        }

        if scaled > 0 {
            let status = AppScalerStatus::succeeded(scaler.metadata.generation);
            self.write_status(&scaler, status).await?;
        } else {
            debug!("All targets at desired replicas");
        }

        Ok(Action::requeue(self.requeue_interval))
    }

    /// Write `status` unless the stored status already equals it.
    ///
    /// Returns true if a write happened.
    async fn write_status(
        &self,
        scaler: &AppScaler,
        status: AppScalerStatus,
    ) -> Result<bool, ReconcileError> {
        if scaler.status == status {
            debug!(phase = %status.phase, "Status unchanged, skipping write");
            return Ok(false);
        }

        let phase = status.phase;
        let mut update = scaler.clone();
        update.status = status;

        self.store
            .update_scaler_status(&update)
            .await
            .map_err(|source| ReconcileError::StatusWrite {
                scaler: scaler.key().clone(),
                source,
            })?;

        info!(phase = %phase, "Updated AppScaler status");
        Ok(true)
    }
}
