//! Kubernetes API server binding of [`ClusterClient`]

use super::{ClusterClient, RecordEvent, WriteMode};
use crate::crd::{ContainerScale, ServiceLevelAgreement, NODE_LABEL};
use crate::error::ScaleError;
use crate::models::{RecordKey, ResourceVector};
use crate::quantity;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "sla-autoscaler";

/// Cluster client backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KubeCluster").finish()
    }
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params(mode: WriteMode) -> PostParams {
        PostParams {
            dry_run: mode.is_dry_run(),
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn records(&self, namespace: &str) -> Api<ContainerScale> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Forward tracking record deletions and watch resyncs to `tx`
    ///
    /// The task ends when the receiver is dropped.
    pub fn spawn_record_watcher(&self, tx: mpsc::Sender<RecordEvent>) -> JoinHandle<()> {
        let api: Api<ContainerScale> = Api::all(self.client.clone());

        tokio::spawn(async move {
            info!("Watching tracking records");
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();

            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    Ok(watcher::Event::Deleted(record)) => {
                        Some(RecordEvent::Deleted(RecordKey::of(&record)))
                    }
                    Ok(watcher::Event::Restarted(records)) => Some(RecordEvent::Resynced(
                        records.iter().map(RecordKey::of).collect(),
                    )),
                    Ok(watcher::Event::Applied(_)) => None,
                    Err(e) => {
                        warn!(error = %e, "Tracking record watch failed");
                        None
                    }
                };

                if let Some(event) = forwarded {
                    if tx.send(event).await.is_err() {
                        debug!("Record event receiver dropped, stopping watcher");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<String>, ScaleError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ScaleError::from_kube("NodeList", "", e))?;
        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }

    async fn node_capacity(&self, node: &str) -> Result<ResourceVector, ScaleError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node_obj = api
            .get(node)
            .await
            .map_err(|e| ScaleError::from_kube("Node", node, e))?;

        let allocatable = node_obj
            .status
            .and_then(|s| s.allocatable)
            .ok_or_else(|| ScaleError::Api(format!("node {} reports no allocatable resources", node)))?;

        match quantity::read_resources(&allocatable)? {
            (Some(cpu), Some(memory)) => Ok(ResourceVector::new(cpu, memory)),
            _ => Err(ScaleError::Api(format!(
                "node {} allocatable lacks cpu or memory",
                node
            ))),
        }
    }

    async fn list_records(&self, node: &str) -> Result<Vec<ContainerScale>, ScaleError> {
        let api: Api<ContainerScale> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{}={}", NODE_LABEL, node));
        let records = api
            .list(&params)
            .await
            .map_err(|e| ScaleError::from_kube("ContainerScaleList", node, e))?;
        Ok(records.items)
    }

    async fn get_record(&self, key: &RecordKey) -> Result<ContainerScale, ScaleError> {
        self.records(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| ScaleError::from_kube("ContainerScale", &key.to_string(), e))
    }

    async fn get_agreement(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceLevelAgreement, ScaleError> {
        let api: Api<ServiceLevelAgreement> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ScaleError::from_kube("ServiceLevelAgreement", name, e))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ScaleError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ScaleError::from_kube("Pod", name, e))
    }

    async fn replace_pod(&self, pod: &Pod, mode: WriteMode) -> Result<Pod, ScaleError> {
        let name = pod.name_any();
        let api: Api<Pod> =
            Api::namespaced(self.client.clone(), &pod.namespace().unwrap_or_default());
        api.replace(&name, &Self::post_params(mode), pod)
            .await
            .map_err(|e| ScaleError::from_kube("Pod", &name, e))
    }

    async fn replace_record(
        &self,
        record: &ContainerScale,
        mode: WriteMode,
    ) -> Result<ContainerScale, ScaleError> {
        let key = record.key();
        self.records(&key.namespace)
            .replace(&key.name, &Self::post_params(mode), record)
            .await
            .map_err(|e| ScaleError::from_kube("ContainerScale", &key.to_string(), e))
    }

    async fn replace_record_status(
        &self,
        record: &ContainerScale,
        mode: WriteMode,
    ) -> Result<ContainerScale, ScaleError> {
        let key = record.key();
        let body = serde_json::to_vec(record)
            .map_err(|e| ScaleError::Consistency(format!("unserializable record {}: {}", key, e)))?;
        self.records(&key.namespace)
            .replace_status(&key.name, &Self::post_params(mode), body)
            .await
            .map_err(|e| ScaleError::from_kube("ContainerScale", &key.to_string(), e))
    }
}
