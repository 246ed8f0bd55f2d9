//! Access to the cluster's persistence API
//!
//! The pipeline never caches cluster objects across cycles: every stage reads
//! the API server through [`ClusterClient`] when it needs an object.

mod kubernetes;
pub mod memory;

pub use kubernetes::KubeCluster;
pub use memory::{FaultKind, InMemoryCluster, Operation};

use crate::crd::{ContainerScale, ServiceLevelAgreement};
use crate::error::ScaleError;
use crate::models::{RecordKey, ResourceVector};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

/// Whether a write is persisted or only validated by the API server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    DryRun,
    Commit,
}

impl WriteMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, WriteMode::DryRun)
    }
}

/// Tracking record lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// A record was deleted
    Deleted(RecordKey),
    /// The full set of live records after a watch (re)start
    Resynced(Vec<RecordKey>),
}

/// Operations the pipeline needs from the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Names of all schedulable nodes
    async fn list_nodes(&self) -> Result<Vec<String>, ScaleError>;

    /// Allocatable CPU and memory of a node
    async fn node_capacity(&self, node: &str) -> Result<ResourceVector, ScaleError>;

    /// Tracking records labelled with the given node, in list order
    async fn list_records(&self, node: &str) -> Result<Vec<ContainerScale>, ScaleError>;

    async fn get_record(&self, key: &RecordKey) -> Result<ContainerScale, ScaleError>;

    async fn get_agreement(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceLevelAgreement, ScaleError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ScaleError>;

    /// Replace a pod (requests/limits update)
    async fn replace_pod(&self, pod: &Pod, mode: WriteMode) -> Result<Pod, ScaleError>;

    /// Replace a record's metadata and spec; status is left untouched
    async fn replace_record(
        &self,
        record: &ContainerScale,
        mode: WriteMode,
    ) -> Result<ContainerScale, ScaleError>;

    /// Replace a record's status subresource; spec is left untouched
    async fn replace_record_status(
        &self,
        record: &ContainerScale,
        mode: WriteMode,
    ) -> Result<ContainerScale, ScaleError>;
}
