//! Resource updater stage
//!
//! Applies each record's persisted `status.actualResources` to its pod and
//! stores the record's recommendation, either both or neither:
//!
//! 1. both replacements are validated with a dry run
//! 2. the pod is committed, then the record
//! 3. if the record commit fails, the pod's previous resources are restored
//!
//! Transient failures are redelivered through the updater's own queue with
//! exponential backoff; precondition violations are dead-lettered at once.

mod audit;
mod retry;

pub use audit::AuditLog;
pub use retry::{
    DeadLetter, DeadLetterLog, RetryPolicy, DEAD_LETTER_CAPACITY, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
};

use crate::cluster::{ClusterClient, WriteMode};
use crate::crd::ContainerScale;
use crate::error::{ErrorClass, ScaleError};
use crate::health::{components, HealthRegistry};
use crate::models::{NodeBatch, RecordKey, ResourceVector};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::pipeline::{Stage, WorkQueue};
use crate::quantity;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, ResourceRequirements};
use kube::ResourceExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// QoS class whose containers have requests equal to limits
pub const GUARANTEED_QOS: &str = "Guaranteed";

/// Outcome of one batch delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Redelivery waiting out its backoff or for queue space
struct PendingRetry {
    node: String,
    records: Vec<RecordKey>,
    attempt: u32,
    task: Option<JoinHandle<()>>,
}

pub struct ResourceUpdater {
    cluster: Arc<dyn ClusterClient>,
    /// Own input queue, used for redelivery
    queue: WorkQueue<NodeBatch>,
    retry: RetryPolicy,
    pending_retries: Arc<DashMap<u64, PendingRetry>>,
    next_retry: AtomicU64,
    audit: Option<AuditLog>,
    dead_letters: DeadLetterLog,
    health: HealthRegistry,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl ResourceUpdater {
    pub fn new(cluster: Arc<dyn ClusterClient>, queue: WorkQueue<NodeBatch>) -> Self {
        Self {
            cluster,
            queue,
            retry: RetryPolicy::default(),
            pending_retries: Arc::new(DashMap::new()),
            next_retry: AtomicU64::new(0),
            audit: None,
            dead_letters: DeadLetterLog::default(),
            health: HealthRegistry::new(),
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("sla-autoscaler"),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
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

    pub fn queue(&self) -> &WorkQueue<NodeBatch> {
        &self.queue
    }

    /// Redeliveries not yet back in the queue
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.len()
    }

    /// Cancel undelivered retries once the workers have stopped
    ///
    /// Every retry still waiting, and every batch left in the queue, is logged
    /// as dropped. Returns the number of dropped batches.
    pub fn abandon_retries(&self) -> usize {
        let ids: Vec<u64> = self.pending_retries.iter().map(|e| *e.key()).collect();
        let mut dropped = 0;
        for id in ids {
            let Some((_, pending)) = self.pending_retries.remove(&id) else {
                continue;
            };
            if let Some(task) = &pending.task {
                task.abort();
            }
            warn!(
                node = %pending.node,
                records = ?pending.records,
                attempt = pending.attempt,
                "Dropped pending update retry on shutdown"
            );
            dropped += 1;
        }
        while let Some(batch) = self.queue.try_pop() {
            let records: Vec<RecordKey> = batch.records.iter().map(|r| r.key()).collect();
            warn!(
                node = %batch.node,
                records = ?records,
                attempt = batch.attempt,
                "Dropped queued update batch on shutdown"
            );
            dropped += 1;
        }
        dropped
    }

    /// Records given up on, oldest first
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot().await
    }

    /// Apply one record to its pod and persist it
    ///
    /// The record and pod are read fresh; the pod receives the persisted
    /// `status.actualResources`, the record keeps the batch's recommendation.
    pub async fn apply_record(&self, record: &ContainerScale) -> Result<ContainerScale, ScaleError> {
        let key = record.key();
        let fresh = self.cluster.get_record(&key).await?;
        let actual = fresh
            .actual_resources()
            .ok_or_else(|| precondition(&key, "record has no actual resources"))?;

        let pod_ref = &fresh.spec.pod_ref;
        let pod = self
            .cluster
            .get_pod(&pod_ref.namespace, &pod_ref.name)
            .await?;
        check_guaranteed(&key, &pod)?;
        if !actual.is_positive() {
            return Err(precondition(
                &key,
                &format!(
                    "actual resources must be positive, got {}m CPU and {} bytes",
                    actual.cpu_millicores, actual.memory_bytes
                ),
            ));
        }

        let updated_pod = with_resources(&pod, actual);
        let mut updated_record = fresh.clone();
        updated_record.spec.desired_resources = record.spec.desired_resources;

        self.cluster
            .replace_pod(&updated_pod, WriteMode::DryRun)
            .await?;
        self.cluster
            .replace_record(&updated_record, WriteMode::DryRun)
            .await?;

        let committed_pod = self
            .cluster
            .replace_pod(&updated_pod, WriteMode::Commit)
            .await?;
        let committed = match self
            .cluster
            .replace_record(&updated_record, WriteMode::Commit)
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                self.restore_pod(&key, &pod, committed_pod, &e).await?;
                return Err(e);
            }
        };

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&committed).await {
                warn!(record = %key, path = %audit.path().display(), error = %e, "Failed to write audit entry");
            }
        }
        self.logger.log_applied(&key, &pod.name_any(), actual);
        Ok(committed)
    }

    /// Put the pre-update resources back after a failed record commit
    async fn restore_pod(
        &self,
        key: &RecordKey,
        original: &Pod,
        mut committed: Pod,
        cause: &ScaleError,
    ) -> Result<(), ScaleError> {
        let previous = first_container_resources(original);
        if let Some(container) = committed
            .spec
            .as_mut()
            .and_then(|s| s.containers.first_mut())
        {
            container.resources = previous;
        }

        match self.cluster.replace_pod(&committed, WriteMode::Commit).await {
            Ok(_) => {
                warn!(record = %key, error = %cause, "Record commit failed, restored pod resources");
                Ok(())
            }
            Err(e) => Err(ScaleError::Consistency(format!(
                "pod {} left updated without record {}: restore failed ({}) after record commit failed ({})",
                committed.name_any(),
                key,
                e,
                cause
            ))),
        }
    }

    /// Deliver a batch once, scheduling redelivery of transient failures
    pub async fn process_batch(&self, batch: NodeBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut transient = Vec::new();

        for record in &batch.records {
            let start = Instant::now();
            let result = self.apply_record(record).await;
            self.metrics
                .observe_update_latency(start.elapsed().as_secs_f64());

            match result {
                Ok(_) => {
                    outcome.applied += 1;
                    self.metrics.inc_updates_applied();
                }
                Err(e) => {
                    self.metrics.inc_updates_failed();
                    match e.class() {
                        ErrorClass::Transient => {
                            debug!(record = %record.key(), attempt = batch.attempt, error = %e, "Transient update failure");
                            transient.push((record.clone(), e));
                        }
                        ErrorClass::Precondition => {
                            self.dead_letter(&batch, record, &e).await;
                            outcome.dead_lettered += 1;
                        }
                        ErrorClass::Consistency => {
                            error!(record = %record.key(), error = %e, "Update left inconsistent state");
                            self.dead_letter(&batch, record, &e).await;
                            outcome.dead_lettered += 1;
                        }
                    }
                }
            }
        }

        if transient.is_empty() {
            return outcome;
        }

        if self.retry.should_retry(batch.attempt) {
            outcome.retried = transient.len();
            let retry = batch.retry_with(transient.into_iter().map(|(r, _)| r).collect());
            self.schedule_retry(retry);
        } else {
            for (record, e) in &transient {
                self.dead_letter(&batch, record, e).await;
            }
            outcome.dead_lettered += transient.len();
        }
        outcome
    }

    fn schedule_retry(&self, batch: NodeBatch) {
        let delay = self.retry.backoff(batch.attempt - 1);
        let queue = self.queue.clone();
        self.metrics.inc_retries_scheduled();
        debug!(
            node = %batch.node,
            records = batch.len(),
            attempt = batch.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling update retry"
        );

        let id = self.next_retry.fetch_add(1, Ordering::Relaxed);
        self.pending_retries.insert(
            id,
            PendingRetry {
                node: batch.node.clone(),
                records: batch.records.iter().map(|r| r.key()).collect(),
                attempt: batch.attempt,
                task: None,
            },
        );

        let pending = self.pending_retries.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let node = batch.node.clone();
            let pushed = queue.push(batch).await;
            pending.remove(&id);
            if let Err(e) = pushed {
                warn!(node = %node, error = %e, "Dropped update retry");
            }
        });
        // The entry is gone if the retry was already delivered
        if let Some(mut entry) = self.pending_retries.get_mut(&id) {
            entry.task = Some(task);
        }
    }

    async fn dead_letter(&self, batch: &NodeBatch, record: &ContainerScale, err: &ScaleError) {
        let key = record.key();
        self.logger
            .log_dead_letter(&key, &batch.node, batch.attempt, &err.to_string());
        self.metrics.inc_dead_letters();
        self.dead_letters
            .push(DeadLetter {
                record: key,
                node: batch.node.clone(),
                attempts: batch.attempt,
                reason: err.to_string(),
                class: err.class(),
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[async_trait]
impl Stage for ResourceUpdater {
    type Item = NodeBatch;

    fn name(&self) -> &'static str {
        components::RESOURCE_UPDATER
    }

    async fn handle(&self, batch: NodeBatch) {
        let node = batch.node.clone();
        let outcome = self.process_batch(batch).await;
        debug!(
            node = %node,
            applied = outcome.applied,
            retried = outcome.retried,
            dead_lettered = outcome.dead_lettered,
            "Processed update batch"
        );

        if outcome.dead_lettered > 0 {
            self.health
                .set_degraded(
                    components::RESOURCE_UPDATER,
                    format!("{} record(s) dead-lettered on {}", outcome.dead_lettered, node),
                )
                .await;
        } else if outcome.retried == 0 {
            self.health.set_healthy(components::RESOURCE_UPDATER).await;
        }
    }
}

fn precondition(key: &RecordKey, reason: &str) -> ScaleError {
    ScaleError::Precondition {
        target: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Require a single-container pod with requests equal to limits
fn check_guaranteed(key: &RecordKey, pod: &Pod) -> Result<(), ScaleError> {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    if containers.len() != 1 {
        return Err(precondition(
            key,
            &format!("expected exactly one container, found {}", containers.len()),
        ));
    }

    if let Some(qos) = pod.status.as_ref().and_then(|s| s.qos_class.as_deref()) {
        if qos != GUARANTEED_QOS {
            return Err(precondition(key, &format!("pod QoS class is {}", qos)));
        }
    }

    let resources = containers[0].resources.as_ref();
    let empty = Default::default();
    let (req_cpu, req_memory) =
        quantity::read_resources(resources.and_then(|r| r.requests.as_ref()).unwrap_or(&empty))?;
    let (lim_cpu, lim_memory) =
        quantity::read_resources(resources.and_then(|r| r.limits.as_ref()).unwrap_or(&empty))?;

    let (Some(lim_cpu), Some(lim_memory)) = (lim_cpu, lim_memory) else {
        return Err(precondition(key, "container has no CPU and memory limits"));
    };
    // Omitted requests default to the limits
    if req_cpu.unwrap_or(lim_cpu) != lim_cpu || req_memory.unwrap_or(lim_memory) != lim_memory {
        return Err(precondition(key, "container requests differ from limits"));
    }
    Ok(())
}

fn first_container_resources(pod: &Pod) -> Option<ResourceRequirements> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.resources.clone())
}

/// Copy of `pod` with the CPU and memory requests and limits of its container
/// set to `resources`
fn with_resources(pod: &Pod, resources: ResourceVector) -> Pod {
    let mut updated = pod.clone();
    if let Some(container) = updated
        .spec
        .as_mut()
        .and_then(|s| s.containers.first_mut())
    {
        let requirements = container.resources.get_or_insert_with(Default::default);
        // Other resources (ephemeral storage, devices) are kept as they are
        for map in [&mut requirements.requests, &mut requirements.limits] {
            map.get_or_insert_with(Default::default)
                .extend(quantity::resource_map(resources));
        }
    }
    updated
}
