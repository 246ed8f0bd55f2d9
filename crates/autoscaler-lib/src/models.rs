//! Core data models for the autoscaling pipeline

use crate::crd::ContainerScale;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource kinds the pipeline controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Memory];

    /// Key used in Kubernetes resource maps
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU (milli-cores) and memory (bytes) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVector {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
}

impl ResourceVector {
    pub fn new(cpu_millicores: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
        }
    }

    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Cpu => self.cpu_millicores,
            ResourceKind::Memory => self.memory_bytes,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: i64) {
        match kind {
            ResourceKind::Cpu => self.cpu_millicores = value,
            ResourceKind::Memory => self.memory_bytes = value,
        }
    }

    /// True when both CPU and memory are strictly positive
    pub fn is_positive(&self) -> bool {
        self.cpu_millicores > 0 && self.memory_bytes > 0
    }
}

/// Per-kind flags recording whether node arbitration reduced a value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundFlags {
    pub cpu: bool,
    pub memory: bool,
}

impl BoundFlags {
    pub fn get(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, bounded: bool) {
        match kind {
            ResourceKind::Cpu => self.cpu = bounded,
            ResourceKind::Memory => self.memory = bounded,
        }
    }
}

/// Stable identity of a tracking record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(record: &ContainerScale) -> Self {
        Self {
            namespace: record.namespace().unwrap_or_default(),
            name: record.name_any(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// All tracking records of one node for one control cycle
#[derive(Debug, Clone)]
pub struct NodeBatch {
    pub node: String,
    pub records: Vec<ContainerScale>,
    /// Delivery attempt at the resource updater, starting at 1
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl NodeBatch {
    pub fn new(node: impl Into<String>, records: Vec<ContainerScale>) -> Self {
        Self {
            node: node.into(),
            records,
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    /// Sum of desired resources across the batch
    pub fn desired_total(&self) -> ResourceVector {
        self.records
            .iter()
            .fold(ResourceVector::default(), |mut total, record| {
                let desired = record.spec.desired_resources;
                total.cpu_millicores = total.cpu_millicores.saturating_add(desired.cpu_millicores);
                total.memory_bytes = total.memory_bytes.saturating_add(desired.memory_bytes);
                total
            })
    }

    /// Batch carrying a subset of records for the next delivery attempt
    pub fn retry_with(&self, records: Vec<ContainerScale>) -> Self {
        Self {
            node: self.node.clone(),
            records,
            attempt: self.attempt + 1,
            created_at: self.created_at,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Typed response-time sample polled from a workload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseTimeSample {
    pub response_time_millis: f64,
}

impl ResponseTimeSample {
    pub fn seconds(&self) -> f64 {
        self.response_time_millis / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::test_support::record;

    #[test]
    fn test_resource_vector_accessors() {
        let mut v = ResourceVector::new(250, 1024);
        assert_eq!(v.get(ResourceKind::Cpu), 250);
        v.set(ResourceKind::Memory, 2048);
        assert_eq!(v.memory_bytes, 2048);
        assert!(v.is_positive());
        assert!(!ResourceVector::new(0, 1).is_positive());
    }

    #[test]
    fn test_desired_total() {
        let batch = NodeBatch::new(
            "node-a",
            vec![
                record("a", "node-a", ResourceVector::new(200, 100)),
                record("b", "node-a", ResourceVector::new(100, 50)),
            ],
        );
        assert_eq!(batch.desired_total(), ResourceVector::new(300, 150));
    }

    #[test]
    fn test_retry_increments_attempt() {
        let batch = NodeBatch::new("node-a", vec![]);
        let retry = batch.retry_with(vec![]);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.node, "node-a");
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(RecordKey::new("default", "web-0-app").to_string(), "default/web-0-app");
    }
}
