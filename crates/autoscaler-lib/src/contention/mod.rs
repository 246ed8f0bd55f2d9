//! Contention manager stage
//!
//! Fits the recommendations of a node into its allocatable capacity, bounds
//! them by each record's agreement and persists the result in the records'
//! status before handing the batch to the resource updater.

mod arbitration;

pub use arbitration::{arbitrate, proportional, Allocation, Arbitration};

use crate::cluster::{ClusterClient, WriteMode};
use crate::crd::{ContainerScale, ContainerScaleStatus, ServiceLevelAgreementSpec};
use crate::error::{ErrorClass, ScaleError};
use crate::health::{components, HealthRegistry};
use crate::models::{NodeBatch, RecordKey, ResourceKind, ResourceVector};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::pipeline::{Stage, WorkQueue};
use crate::recommender::bound;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct ContentionManager {
    cluster: Arc<dyn ClusterClient>,
    output: WorkQueue<NodeBatch>,
    health: HealthRegistry,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl ContentionManager {
    pub fn new(cluster: Arc<dyn ClusterClient>, output: WorkQueue<NodeBatch>) -> Self {
        Self {
            cluster,
            output,
            health: HealthRegistry::new(),
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("sla-autoscaler"),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Arbitrate a batch and persist capped values; returns the batch to forward
    ///
    /// Stops at the first failed read or status write; records written before
    /// the failure keep their new status.
    pub async fn resolve(&self, batch: NodeBatch) -> Result<NodeBatch, ScaleError> {
        let capacity = self.cluster.node_capacity(&batch.node).await?;

        let desired: Vec<ResourceVector> = batch
            .records
            .iter()
            .map(|r| r.spec.desired_resources)
            .collect();
        let arbitration = arbitrate(&desired, capacity);

        for kind in ResourceKind::ALL {
            if arbitration.oversubscribed.get(kind) {
                self.metrics.inc_oversubscribed(kind);
            }
        }

        let mut resolved = Vec::with_capacity(batch.records.len());
        for (record, allocation) in batch.records.iter().zip(&arbitration.allocations) {
            let written = self.persist_allocation(record, allocation).await?;
            resolved.push(written);
        }

        self.logger.log_arbitration(
            &batch.node,
            capacity,
            arbitration.desired_total,
            arbitration.oversubscribed,
            resolved.len(),
        );

        Ok(NodeBatch {
            records: resolved,
            ..batch
        })
    }

    async fn persist_allocation(
        &self,
        record: &ContainerScale,
        allocation: &Allocation,
    ) -> Result<ContainerScale, ScaleError> {
        let key = record.key();
        let sla_ref = &record.spec.sla_ref;
        let agreement = self
            .cluster
            .get_agreement(&sla_ref.namespace, &sla_ref.name)
            .await?;
        let capped = clamp_to_agreement(&key, allocation.resources, &agreement.spec)?;

        let mut fresh = self.cluster.get_record(&key).await?;
        fresh.status = Some(ContainerScaleStatus {
            actual_resources: capped,
            capped_resources: capped,
            bounded: allocation.bounded,
        });

        let mut written = self
            .cluster
            .replace_record_status(&fresh, WriteMode::Commit)
            .await
            .map_err(|e| {
                self.metrics.inc_status_write_failures();
                e
            })?;

        // Carry the recommendation on; it is persisted by the resource updater
        written.spec.desired_resources = record.spec.desired_resources;
        debug!(
            record = %key,
            capped_cpu_millicores = capped.cpu_millicores,
            capped_memory_bytes = capped.memory_bytes,
            "Persisted capped resources"
        );
        Ok(written)
    }
}

/// Bound an arbitrated vector by the agreement
///
/// The agreement's floor wins over node capacity.
fn clamp_to_agreement(
    key: &RecordKey,
    resources: ResourceVector,
    agreement: &ServiceLevelAgreementSpec,
) -> Result<ResourceVector, ScaleError> {
    let mut capped = resources;
    for kind in ResourceKind::ALL {
        let bounded = bound(
            resources.get(kind),
            agreement.min_resources.get(kind),
            agreement.max_resources.get(kind),
            kind,
        )?;
        if bounded.value > resources.get(kind) {
            warn!(
                record = %key,
                resource = %kind,
                arbitrated = resources.get(kind),
                floor = bounded.value,
                "Agreement floor exceeds arbitrated share"
            );
        }
        capped.set(kind, bounded.value);
    }
    Ok(capped)
}

#[async_trait]
impl Stage for ContentionManager {
    type Item = NodeBatch;

    fn name(&self) -> &'static str {
        components::CONTENTION_MANAGER
    }

    async fn handle(&self, batch: NodeBatch) {
        let node = batch.node.clone();
        match self.resolve(batch).await {
            Ok(resolved) => match self.output.push(resolved).await {
                Ok(()) => self.health.set_healthy(components::CONTENTION_MANAGER).await,
                Err(e) => {
                    error!(node = %node, error = %e, "Failed to forward node batch");
                    self.health
                        .set_unhealthy(components::CONTENTION_MANAGER, e.to_string())
                        .await;
                }
            },
            Err(e) => {
                self.metrics.inc_node_cycle_failures();
                if e.class() == ErrorClass::Consistency {
                    error!(node = %node, error = %e, "Contention resolution failed");
                } else {
                    warn!(node = %node, error = %e, "Dropped node batch");
                }
                self.health
                    .set_degraded(components::CONTENTION_MANAGER, e.to_string())
                    .await;
            }
        }
    }
}
