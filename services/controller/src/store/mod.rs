//! Cluster state store boundary.
//!
//! The controller reads and writes objects only through [`ClusterStore`].
//! A store provides:
//! - Keyed reads of AppScalers and Workloads
//! - Writes guarded by the object's resource version (optimistic concurrency)
//! - A status-only write path for AppScalers
//! - A broadcast stream of change events
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests.

mod memory;

use appscaler_id::{ObjectKey, ObjectUid, ResourceVersion};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::api::{AppScaler, ResourceKind, Workload};

pub use memory::{Fault, MemoryStore, Seed, StoreStats};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    #[error("conflict writing {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        kind: ResourceKind,
        key: ObjectKey,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("{kind} {key} was recreated: expected uid {expected}, found {actual}")]
    Recreated {
        kind: ResourceKind,
        key: ObjectKey,
        expected: ObjectUid,
        actual: ObjectUid,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode seed file: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the write lost a race with another writer, including
    /// one that deleted and recreated the object.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Recreated { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created, or spec replaced.
    Applied,
    /// Only the status changed.
    StatusUpdated,
    Deleted,
}

/// Change notification emitted after every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub change: ChangeKind,
}

/// Store operations used by the controller.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch an AppScaler.
    async fn get_scaler(&self, key: &ObjectKey) -> StoreResult<AppScaler>;

    /// Fetch every AppScaler, ordered by key.
    async fn list_scalers(&self) -> StoreResult<Vec<AppScaler>>;

    /// Fetch a Workload.
    async fn get_workload(&self, key: &ObjectKey) -> StoreResult<Workload>;

    /// Replace a Workload's spec.
    ///
    /// Fails with `Conflict` if `workload.metadata.resource_version` is set
    /// and no longer matches the stored object, or with `Recreated` if the
    /// stored object has a different uid.
    async fn update_workload(&self, workload: &Workload) -> StoreResult<Workload>;

    /// Replace an AppScaler's status, leaving its spec untouched.
    ///
    /// Guarded by `scaler.metadata` like `update_workload`.
    async fn update_scaler_status(&self, scaler: &AppScaler) -> StoreResult<AppScaler>;

    /// Subscribe to change events.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}
