//! Custom resources consumed and maintained by the autoscaler
//!
//! - `ServiceLevelAgreement`: target response time and resource envelope of a
//!   workload, read-only to the pipeline
//! - `ContainerScale`: per-container tracking record, created by external
//!   reconcilers and mutated here (`spec.desiredResources` and `status`)

use crate::error::ScaleError;
use crate::models::{BoundFlags, RecordKey, ResourceKind, ResourceVector};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// API group of the autoscaler resources
pub const API_GROUP: &str = "autoscaling.slo.dev";

/// Label carrying the node a tracking record belongs to
pub const NODE_LABEL: &str = "autoscaling.slo.dev/node";

/// Reference to a namespaced object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

/// Performance agreement of a workload
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "autoscaling.slo.dev",
    version = "v1alpha1",
    kind = "ServiceLevelAgreement",
    plural = "servicelevelagreements",
    shortname = "sla",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLevelAgreementSpec {
    /// Target average response time in milliseconds
    pub target_response_time_millis: f64,
    pub min_resources: ResourceVector,
    pub max_resources: ResourceVector,
    /// Service whose pods the agreement governs
    pub service_ref: NamespacedName,
}

impl ServiceLevelAgreementSpec {
    /// Target response time in seconds
    pub fn setpoint_seconds(&self) -> f64 {
        self.target_response_time_millis / 1000.0
    }

    /// Reject inverted resource envelopes and non-positive targets
    pub fn validate(&self) -> Result<(), ScaleError> {
        for kind in ResourceKind::ALL {
            let (min, max) = (self.min_resources.get(kind), self.max_resources.get(kind));
            if min > max {
                return Err(ScaleError::InvalidBounds { kind, min, max });
            }
        }
        if !self.target_response_time_millis.is_finite() || self.target_response_time_millis <= 0.0 {
            return Err(ScaleError::Precondition {
                target: self.service_ref.name.clone(),
                reason: format!(
                    "target response time must be positive, got {}",
                    self.target_response_time_millis
                ),
            });
        }
        Ok(())
    }
}

/// Tracking record of one container under an agreement
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "autoscaling.slo.dev",
    version = "v1alpha1",
    kind = "ContainerScale",
    plural = "containerscales",
    namespaced,
    status = "ContainerScaleStatus",
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerScaleSpec {
    pub sla_ref: NamespacedName,
    pub pod_ref: NamespacedName,
    pub container_name: String,
    pub node_name: String,
    /// Last recommendation computed by the recommender
    #[serde(default)]
    pub desired_resources: ResourceVector,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerScaleStatus {
    /// Value the resource updater applies to the pod
    #[serde(default)]
    pub actual_resources: ResourceVector,
    /// Value after node-capacity arbitration
    #[serde(default)]
    pub capped_resources: ResourceVector,
    /// Kinds reduced by arbitration in the last cycle
    #[serde(default)]
    pub bounded: BoundFlags,
}

impl ContainerScale {
    pub fn key(&self) -> RecordKey {
        RecordKey::of(self)
    }

    /// Copy of the record carrying a new recommendation
    pub fn with_desired(&self, desired: ResourceVector) -> Self {
        let mut copy = self.clone();
        copy.spec.desired_resources = desired;
        copy
    }

    pub fn actual_resources(&self) -> Option<ResourceVector> {
        self.status.as_ref().map(|s| s.actual_resources)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::agreement;
    use super::*;

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let sla = agreement(ResourceVector::new(500, 10), ResourceVector::new(100, 20));
        match sla.spec.validate() {
            Err(ScaleError::InvalidBounds { kind, min, max }) => {
                assert_eq!(kind, ResourceKind::Cpu);
                assert_eq!((min, max), (500, 100));
            }
            other => panic!("expected invalid bounds, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_accepts_equal_bounds() {
        let sla = agreement(ResourceVector::new(100, 10), ResourceVector::new(100, 10));
        assert!(sla.spec.validate().is_ok());
    }

    #[test]
    fn test_status_deserializes_with_defaults() {
        let status: ContainerScaleStatus =
            serde_json::from_str(r#"{"cappedResources":{"cpuMillicores":5,"memoryBytes":6}}"#)
                .unwrap();
        assert_eq!(status.capped_resources, ResourceVector::new(5, 6));
        assert_eq!(status.actual_resources, ResourceVector::default());
        assert!(!status.bounded.cpu);
    }

    #[test]
    fn test_with_desired_leaves_original_untouched() {
        let original = super::test_support::record("a", "n", ResourceVector::new(1, 1));
        let updated = original.with_desired(ResourceVector::new(9, 9));
        assert_eq!(original.spec.desired_resources, ResourceVector::new(1, 1));
        assert_eq!(updated.spec.desired_resources, ResourceVector::new(9, 9));
    }
}
