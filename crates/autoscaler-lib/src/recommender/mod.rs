//! Recommender stage
//!
//! Turns response-time measurements into a desired CPU/memory vector for every
//! tracked container of a node, and emits the node's records as one batch.

mod control;
mod scheduler;
mod state;

pub use control::{
    bound, step, Bounded, ControlTheoryPolicy, BC, DC, MAX_SCALE_OUT, MIN_CPU_MILLICORES,
};
pub use scheduler::NodeScheduler;
pub use state::{ControllerState, ControllerStateStore, StateCycle};

use crate::cluster::ClusterClient;
use crate::crd::{ContainerScale, ServiceLevelAgreementSpec};
use crate::error::{ErrorClass, ScaleError};
use crate::health::{components, HealthRegistry};
use crate::metric_source::ResponseTimeSource;
use crate::models::{NodeBatch, RecordKey, ResourceVector, ResponseTimeSample};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::pipeline::{Stage, WorkQueue};
use crate::quantity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Feedback law computing a container's next resource vector
pub trait ResourcePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the next desired resources, updating `state` in place
    fn compute_resources(
        &self,
        pod: &Pod,
        record: &ContainerScale,
        agreement: &ServiceLevelAgreementSpec,
        sample: &ResponseTimeSample,
        state: &mut ControllerState,
    ) -> Result<ResourceVector, ScaleError>;
}

/// Per-node recommendation stage
pub struct Recommender {
    cluster: Arc<dyn ClusterClient>,
    source: Arc<dyn ResponseTimeSource>,
    policy: Arc<dyn ResourcePolicy>,
    states: Arc<ControllerStateStore>,
    scheduler: Arc<NodeScheduler>,
    output: WorkQueue<NodeBatch>,
    health: HealthRegistry,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl Recommender {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        source: Arc<dyn ResponseTimeSource>,
        states: Arc<ControllerStateStore>,
        scheduler: Arc<NodeScheduler>,
        output: WorkQueue<NodeBatch>,
    ) -> Self {
        Self {
            cluster,
            source,
            policy: Arc::new(ControlTheoryPolicy::new()),
            states,
            scheduler,
            output,
            health: HealthRegistry::new(),
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("sla-autoscaler"),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ResourcePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Compute the batch of one node
    ///
    /// Any failing record aborts the whole node and leaves every controller
    /// state of the node untouched.
    pub async fn recommend_node(&self, node: &str) -> Result<NodeBatch, ScaleError> {
        let start = Instant::now();

        let records = self.cluster.list_records(node).await?;
        if records.is_empty() {
            return Err(ScaleError::NoRecords {
                node: node.to_string(),
            });
        }

        let cycle = self.states.begin_cycle(records.iter().map(|r| r.key()));
        let mut recommended = Vec::with_capacity(records.len());
        let mut staged = Vec::with_capacity(records.len());
        for record in &records {
            let (updated, state) = self.recommend_record(record).await?;
            staged.push((record.key(), state));
            recommended.push(updated);
        }

        cycle.commit(staged);
        self.metrics.set_controller_states(self.states.len() as i64);
        self.metrics
            .observe_recommendation_latency(start.elapsed().as_secs_f64());

        Ok(NodeBatch::new(node, recommended))
    }

    async fn recommend_record(
        &self,
        record: &ContainerScale,
    ) -> Result<(ContainerScale, ControllerState), ScaleError> {
        let key = record.key();
        let spec = &record.spec;

        let agreement = self
            .cluster
            .get_agreement(&spec.sla_ref.namespace, &spec.sla_ref.name)
            .await?;
        let pod = self
            .cluster
            .get_pod(&spec.pod_ref.namespace, &spec.pod_ref.name)
            .await?;

        if let Some(limits) = container_limits(&pod, &spec.container_name) {
            debug!(
                record = %key,
                cpu_limit_millicores = ?limits.0,
                memory_limit_bytes = ?limits.1,
                "Current container limits"
            );
        }

        let address = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| ScaleError::MetricFetch {
                target: key.to_string(),
                reason: "pod has no IP address".to_string(),
            })?;
        let sample = self.source.response_time(&address).await?;

        let mut state = self
            .states
            .get_or_seed(&key, || ControllerState::initial(seed_cores(record)));
        let desired = self
            .policy
            .compute_resources(&pod, record, &agreement.spec, &sample, &mut state)?;

        self.logger.log_recommendation(
            &key,
            &spec.node_name,
            sample.response_time_millis,
            agreement.spec.target_response_time_millis,
            desired,
        );
        Ok((record.with_desired(desired), state))
    }

    /// Drop the controller state of a deleted record
    pub fn evict(&self, key: &RecordKey) {
        if self.states.evict(key).is_some() {
            self.logger.log_state_evicted(key, "deleted");
            self.metrics.set_controller_states(self.states.len() as i64);
        }
    }

    /// Drop controller states of records missing from a full listing
    pub fn retain_live(&self, live: &[RecordKey]) {
        for key in self.states.retain_live(live) {
            self.logger.log_state_evicted(&key, "resync");
        }
        self.metrics.set_controller_states(self.states.len() as i64);
    }
}

#[async_trait]
impl Stage for Recommender {
    type Item = String;

    fn name(&self) -> &'static str {
        components::RECOMMENDER
    }

    async fn handle(&self, node: String) {
        match self.recommend_node(&node).await {
            Ok(batch) => {
                let records = batch.len();
                match self.output.push(batch).await {
                    Ok(()) => {
                        self.metrics.inc_batches_emitted();
                        debug!(node = %node, records, "Emitted node batch");
                        self.health.set_healthy(components::RECOMMENDER).await;
                    }
                    Err(e) => {
                        error!(node = %node, error = %e, "Failed to emit node batch");
                        self.health
                            .set_unhealthy(components::RECOMMENDER, e.to_string())
                            .await;
                    }
                }
            }
            // Counted apart from failures; stage health is unaffected
            Err(ScaleError::NoRecords { .. }) => {
                self.metrics.inc_empty_node_cycles();
                info!(node = %node, "Node cycle failed: no tracking records");
            }
            Err(e) => {
                self.metrics.inc_node_cycle_failures();
                if e.class() == ErrorClass::Consistency {
                    error!(node = %node, error = %e, "Recommendation failed");
                } else {
                    warn!(node = %node, error = %e, "Recommendation aborted for node");
                }
                self.health
                    .set_degraded(components::RECOMMENDER, e.to_string())
                    .await;
            }
        }
        self.scheduler.complete(&node);
    }
}

/// Starting core estimate of a record without controller state
fn seed_cores(record: &ContainerScale) -> f64 {
    let desired = record.spec.desired_resources.cpu_millicores;
    let actual = record
        .actual_resources()
        .map(|a| a.cpu_millicores)
        .unwrap_or_default();
    if desired > 0 {
        desired as f64
    } else if actual > 0 {
        actual as f64
    } else {
        MIN_CPU_MILLICORES
    }
}

/// Limits of the named container, for context logging only
fn container_limits(pod: &Pod, container: &str) -> Option<(Option<i64>, Option<i64>)> {
    let limits = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .resources
        .as_ref()?
        .limits
        .as_ref()?;
    quantity::read_resources(limits).ok()
}
