//! In-memory cluster for local runs and tests
//!
//! Mirrors the API server behaviour the pipeline relies on: resource versions
//! with optimistic concurrency, dry-run writes without effect, no-op updates
//! that keep the resource version, and separate spec/status writes for
//! tracking records. Faults can be injected per operation and object name.

use super::{ClusterClient, RecordEvent, WriteMode};
use crate::crd::{ContainerScale, ServiceLevelAgreement};
use crate::error::ScaleError;
use crate::models::{RecordKey, ResourceVector};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

/// Fault target matching every object
pub const ANY: &str = "*";

/// Cluster operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListNodes,
    NodeCapacity,
    ListRecords,
    GetRecord,
    GetAgreement,
    GetPod,
    ReplacePod(WriteMode),
    ReplaceRecord(WriteMode),
    ReplaceRecordStatus(WriteMode),
}

/// Failure returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// API server unavailable (transient)
    Unavailable,
    /// Request rejected by validation or admission (precondition)
    Rejected,
}

#[derive(Default)]
pub struct InMemoryCluster {
    nodes: DashMap<String, ResourceVector>,
    agreements: DashMap<(String, String), ServiceLevelAgreement>,
    pods: DashMap<(String, String), Pod>,
    records: DashMap<RecordKey, ContainerScale>,
    faults: DashMap<(Operation, String), FaultKind>,
    version: AtomicU64,
    committed: AtomicU64,
    events: RwLock<Option<mpsc::Sender<RecordEvent>>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn add_node(&self, name: &str, allocatable: ResourceVector) {
        self.nodes.insert(name.to_string(), allocatable);
    }

    pub fn add_agreement(&self, mut agreement: ServiceLevelAgreement) {
        agreement.metadata.resource_version = Some(self.next_version());
        let key = (agreement.namespace().unwrap_or_default(), agreement.name_any());
        self.agreements.insert(key, agreement);
    }

    pub fn add_pod(&self, mut pod: Pod) {
        pod.metadata.resource_version = Some(self.next_version());
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.pods.insert(key, pod);
    }

    pub fn add_record(&self, mut record: ContainerScale) {
        record.metadata.resource_version = Some(self.next_version());
        self.records.insert(record.key(), record);
    }

    /// Delete a record and notify the subscriber, if any
    pub async fn delete_record(&self, key: &RecordKey) -> Option<ContainerScale> {
        let removed = self.records.remove(key).map(|(_, r)| r);
        if removed.is_some() {
            let sender = self.events.read().await.clone();
            if let Some(tx) = sender {
                let _ = tx.send(RecordEvent::Deleted(key.clone())).await;
            }
        }
        removed
    }

    /// Receive record events; replaces any previous subscriber
    pub async fn subscribe(&self) -> mpsc::Receiver<RecordEvent> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.write().await = Some(tx);
        rx
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.clone())
    }

    pub fn record(&self, key: &RecordKey) -> Option<ContainerScale> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Number of committed writes that changed an object
    pub fn committed_writes(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Make `operation` fail for the named object (or [`ANY`])
    pub fn inject_fault(&self, operation: Operation, name: &str, kind: FaultKind) {
        self.faults.insert((operation, name.to_string()), kind);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    fn check_fault(&self, operation: Operation, name: &str) -> Result<(), ScaleError> {
        let fault = self
            .faults
            .get(&(operation, name.to_string()))
            .or_else(|| self.faults.get(&(operation, ANY.to_string())))
            .map(|f| *f);

        match fault {
            None => Ok(()),
            Some(FaultKind::Unavailable) => Err(ScaleError::Api(format!(
                "{:?} {}: service unavailable",
                operation, name
            ))),
            Some(FaultKind::Rejected) => Err(ScaleError::Precondition {
                target: name.to_string(),
                reason: format!("{:?} rejected by admission", operation),
            }),
        }
    }

    fn check_version(
        kind: &'static str,
        name: &str,
        stored: &Option<String>,
        incoming: &Option<String>,
    ) -> Result<(), ScaleError> {
        match incoming {
            Some(v) if Some(v) != stored.as_ref() => Err(ScaleError::Conflict {
                kind,
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn same_content<K: Resource + Clone + PartialEq>(a: &K, b: &K) -> bool {
        let mut a = a.clone();
        let mut b = b.clone();
        a.meta_mut().resource_version = None;
        b.meta_mut().resource_version = None;
        a == b
    }

    fn missing(kind: &'static str, name: impl Into<String>) -> ScaleError {
        ScaleError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<String>, ScaleError> {
        self.check_fault(Operation::ListNodes, ANY)?;
        let mut nodes: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        nodes.sort();
        Ok(nodes)
    }

    async fn node_capacity(&self, node: &str) -> Result<ResourceVector, ScaleError> {
        self.check_fault(Operation::NodeCapacity, node)?;
        self.nodes
            .get(node)
            .map(|c| *c)
            .ok_or_else(|| Self::missing("Node", node))
    }

    async fn list_records(&self, node: &str) -> Result<Vec<ContainerScale>, ScaleError> {
        self.check_fault(Operation::ListRecords, node)?;
        let mut records: Vec<ContainerScale> = self
            .records
            .iter()
            .filter(|r| r.spec.node_name == node)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.key());
        Ok(records)
    }

    async fn get_record(&self, key: &RecordKey) -> Result<ContainerScale, ScaleError> {
        self.check_fault(Operation::GetRecord, &key.name)?;
        self.record(key)
            .ok_or_else(|| Self::missing("ContainerScale", key.to_string()))
    }

    async fn get_agreement(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceLevelAgreement, ScaleError> {
        self.check_fault(Operation::GetAgreement, name)?;
        self.agreements
            .get(&(namespace.to_string(), name.to_string()))
            .map(|a| a.clone())
            .ok_or_else(|| Self::missing("ServiceLevelAgreement", name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ScaleError> {
        self.check_fault(Operation::GetPod, name)?;
        self.pod(namespace, name)
            .ok_or_else(|| Self::missing("Pod", name))
    }

    async fn replace_pod(&self, pod: &Pod, mode: WriteMode) -> Result<Pod, ScaleError> {
        let name = pod.name_any();
        self.check_fault(Operation::ReplacePod(mode), &name)?;

        let key = (pod.namespace().unwrap_or_default(), name.clone());
        let stored = self
            .pods
            .get(&key)
            .map(|p| p.clone())
            .ok_or_else(|| Self::missing("Pod", name.as_str()))?;
        Self::check_version(
            "Pod",
            &name,
            &stored.metadata.resource_version,
            &pod.metadata.resource_version,
        )?;

        if Self::same_content(&stored, pod) {
            return Ok(stored);
        }

        let mut updated = pod.clone();
        if mode.is_dry_run() {
            updated.metadata.resource_version = stored.metadata.resource_version;
            return Ok(updated);
        }
        updated.metadata.resource_version = Some(self.next_version());
        self.pods.insert(key, updated.clone());
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn replace_record(
        &self,
        record: &ContainerScale,
        mode: WriteMode,
    ) -> Result<ContainerScale, ScaleError> {
        let key = record.key();
        self.check_fault(Operation::ReplaceRecord(mode), &key.name)?;

        let stored = self
            .record(&key)
            .ok_or_else(|| Self::missing("ContainerScale", key.to_string()))?;
        Self::check_version(
            "ContainerScale",
            &key.name,
            &stored.metadata.resource_version,
            &record.metadata.resource_version,
        )?;

        // Status belongs to the status subresource
        let mut updated = record.clone();
        updated.status = stored.status.clone();

        if Self::same_content(&stored, &updated) {
            return Ok(stored);
        }
        if mode.is_dry_run() {
            updated.metadata.resource_version = stored.metadata.resource_version;
            return Ok(updated);
        }
        updated.metadata.resource_version = Some(self.next_version());
        self.records.insert(key, updated.clone());
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn replace_record_status(
        &self,
        record: &ContainerScale,
        mode: WriteMode,
    ) -> Result<ContainerScale, ScaleError> {
        let key = record.key();
        self.check_fault(Operation::ReplaceRecordStatus(mode), &key.name)?;

        let stored = self
            .record(&key)
            .ok_or_else(|| Self::missing("ContainerScale", key.to_string()))?;
        Self::check_version(
            "ContainerScale",
            &key.name,
            &stored.metadata.resource_version,
            &record.metadata.resource_version,
        )?;

        let mut updated = stored.clone();
        updated.status = record.status.clone();

        if Self::same_content(&stored, &updated) {
            return Ok(stored);
        }
        if mode.is_dry_run() {
            return Ok(updated);
        }
        updated.metadata.resource_version = Some(self.next_version());
        self.records.insert(key, updated.clone());
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}
