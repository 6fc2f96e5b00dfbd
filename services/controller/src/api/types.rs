//! AppScaler and Workload object definitions.

use std::fmt;

use appscaler_id::{ObjectKey, ObjectUid, ResourceVersion};
use serde::{Deserialize, Serialize};

// =============================================================================
// Metadata
// =============================================================================

/// Kinds of objects held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AppScaler,
    Workload,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppScaler => write!(f, "appscaler"),
            Self::Workload => write!(f, "workload"),
        }
    }
}

/// Metadata common to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(flatten)]
    pub key: ObjectKey,

    /// Assigned by the store at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<ObjectUid>,

    /// Advances on every write. `None` on objects that were never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,

    /// Advances when the spec changes.
    #[serde(default)]
    pub generation: u64,
}

impl ObjectMeta {
    /// Metadata for an object that has not been stored yet.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            uid: None,
            resource_version: None,
            generation: 0,
        }
    }
}

// =============================================================================
// AppScaler
// =============================================================================

/// Scaling policy: keep every target at `replicas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppScaler {
    pub metadata: ObjectMeta,
    pub spec: AppScalerSpec,
    #[serde(default)]
    pub status: AppScalerStatus,
}

impl AppScaler {
    /// Build an unstored AppScaler.
    pub fn new(key: ObjectKey, replicas: u32, targets: Vec<ObjectKey>) -> Self {
        Self {
            metadata: ObjectMeta::new(key),
            spec: AppScalerSpec { replicas, targets },
            status: AppScalerStatus::default(),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.metadata.key
    }

    /// Returns true if `workload` is one of this scaler's targets.
    pub fn targets(&self, workload: &ObjectKey) -> bool {
        self.spec.targets.iter().any(|target| target == workload)
    }
}

/// Desired state of an AppScaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppScalerSpec {
    /// Replica count every target should run.
    pub replicas: u32,

    /// Workloads to scale. Order only affects logging.
    #[serde(default, alias = "deployments")]
    pub targets: Vec<ObjectKey>,
}

/// Observed state of an AppScaler, as of the most recent pass that changed
/// anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppScalerStatus {
    pub phase: ScalerPhase,

    /// Spec generation the phase was computed against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_errors: Vec<TargetError>,
}

impl AppScalerStatus {
    /// Every target converged at `generation`.
    pub fn succeeded(generation: u64) -> Self {
        Self {
            phase: ScalerPhase::Succeeded,
            observed_generation: Some(generation),
            target_errors: Vec::new(),
        }
    }

    /// A target update failed at `generation`. `partial` is set when an
    /// earlier target in the same pass was already scaled.
    pub fn failed(generation: u64, partial: bool, error: TargetError) -> Self {
        let phase = if partial {
            ScalerPhase::PartialFailure
        } else {
            ScalerPhase::Failed
        };

        Self {
            phase,
            observed_generation: Some(generation),
            target_errors: vec![error],
        }
    }
}

/// Aggregate convergence outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalerPhase {
    #[default]
    Pending,
    Succeeded,
    Failed,
    PartialFailure,
}

impl ScalerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::PartialFailure => "PartialFailure",
        }
    }
}

impl fmt::Display for ScalerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single target could not be scaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetError {
    pub target: ObjectKey,
    pub message: String,
}

// =============================================================================
// Workload
// =============================================================================

/// A scalable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
}

impl Workload {
    /// Build an unstored Workload.
    pub fn new(key: ObjectKey, replicas: Option<u32>) -> Self {
        Self {
            metadata: ObjectMeta::new(key),
            spec: WorkloadSpec { replicas },
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.metadata.key
    }
}

/// Desired state of a Workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// `None` means unspecified, which is not the same as zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_scaler_json_accepts_deployments_alias() {
        let scaler: AppScaler = serde_json::from_value(serde_json::json!({
            "metadata": { "namespace": "default", "name": "web-scaler" },
            "spec": {
                "replicas": 5,
                "deployments": [{ "namespace": "default", "name": "web" }]
            }
        }))
        .unwrap();

        assert_eq!(scaler.key(), &key("default/web-scaler"));
        assert_eq!(scaler.spec.targets, vec![key("default/web")]);
        assert_eq!(scaler.status.phase, ScalerPhase::Pending);
        assert!(scaler.metadata.resource_version.is_none());
    }

    #[test]
    fn test_workload_unset_replicas_is_not_zero() {
        let unset: Workload = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web" }
        }))
        .unwrap();
        let zero: Workload = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web" },
            "spec": { "replicas": 0 }
        }))
        .unwrap();

        assert_eq!(unset.spec.replicas, None);
        assert_eq!(zero.spec.replicas, Some(0));
        assert_ne!(unset, zero);
    }

    #[test]
    fn test_scaler_targets() {
        let scaler = AppScaler::new(key("s"), 2, vec![key("a"), key("prod/b")]);
        assert!(scaler.targets(&key("prod/b")));
        assert!(!scaler.targets(&key("b")));
    }

    #[test]
    fn test_failed_status_phase() {
        let error = TargetError {
            target: key("a"),
            message: "boom".to_string(),
        };
        assert_eq!(
            AppScalerStatus::failed(1, false, error.clone()).phase,
            ScalerPhase::Failed
        );
        assert_eq!(
            AppScalerStatus::failed(1, true, error).phase,
            ScalerPhase::PartialFailure
        );
    }
}
