//! Wiring of the three stages into a running control pipeline
//!
//! ```text
//! ticker -> [nodes] -> Recommender -> [recommendations] -> ContentionManager
//!        -> [updates] -> ResourceUpdater (-> [updates] on retry)
//! ```

mod queue;
mod worker;

pub use queue::{WorkQueue, DEFAULT_QUEUE_CAPACITY};
pub use worker::{run_worker, Stage};

use crate::cluster::{ClusterClient, RecordEvent};
use crate::contention::ContentionManager;
use crate::health::HealthRegistry;
use crate::metric_source::ResponseTimeSource;
use crate::models::NodeBatch;
use crate::observability::StructuredLogger;
use crate::recommender::{
    ControlTheoryPolicy, ControllerStateStore, NodeScheduler, Recommender, ResourcePolicy,
};
use crate::updater::{AuditLog, ResourceUpdater, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Time workers get to finish their current item after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name of this controller instance in logs
    pub instance_name: String,
    pub control_interval: Duration,
    pub recommender_workers: usize,
    pub contention_workers: usize,
    pub updater_workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Audit trail of applied records; disabled when unset
    pub audit_log_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instance_name: "sla-autoscaler".to_string(),
            control_interval: Duration::from_secs(5),
            recommender_workers: 4,
            contention_workers: 2,
            updater_workers: 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
            audit_log_path: None,
        }
    }
}

/// Stages and queues of one pipeline instance
struct Stages {
    scheduler: Arc<NodeScheduler>,
    recommender: Arc<Recommender>,
    contention: Arc<ContentionManager>,
    updater: Arc<ResourceUpdater>,
    recommendations: WorkQueue<NodeBatch>,
}

pub struct Pipeline {
    config: PipelineConfig,
    cluster: Arc<dyn ClusterClient>,
    source: Arc<dyn ResponseTimeSource>,
    policy: Arc<dyn ResourcePolicy>,
    states: Arc<ControllerStateStore>,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        cluster: Arc<dyn ClusterClient>,
        source: Arc<dyn ResponseTimeSource>,
    ) -> Self {
        let logger = StructuredLogger::new(config.instance_name.clone());
        Self {
            config,
            cluster,
            source,
            policy: Arc::new(ControlTheoryPolicy::new()),
            states: Arc::new(ControllerStateStore::new()),
            health: HealthRegistry::new(),
            logger,
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

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub fn states(&self) -> Arc<ControllerStateStore> {
        self.states.clone()
    }

    fn build(&self) -> Stages {
        let capacity = self.config.queue_capacity;
        let nodes = WorkQueue::bounded("nodes", capacity);
        let recommendations = WorkQueue::bounded("recommendations", capacity);
        let updates = WorkQueue::bounded("updates", capacity);

        let scheduler = Arc::new(NodeScheduler::new(nodes));
        let recommender = Recommender::new(
            self.cluster.clone(),
            self.source.clone(),
            self.states.clone(),
            scheduler.clone(),
            recommendations.clone(),
        )
        .with_policy(self.policy.clone())
        .with_health(self.health.clone())
        .with_logger(self.logger.clone());

        let contention = ContentionManager::new(self.cluster.clone(), updates.clone())
            .with_health(self.health.clone())
            .with_logger(self.logger.clone());

        let mut updater = ResourceUpdater::new(self.cluster.clone(), updates)
            .with_retry_policy(self.config.retry)
            .with_health(self.health.clone())
            .with_logger(self.logger.clone());
        if let Some(path) = &self.config.audit_log_path {
            updater = updater.with_audit_log(AuditLog::new(path));
        }

        Stages {
            scheduler,
            recommender: Arc::new(recommender),
            contention: Arc::new(contention),
            updater: Arc::new(updater),
            recommendations,
        }
    }

    /// Run until `shutdown` fires
    ///
    /// `events` carries record deletions and resyncs that evict controller
    /// state.
    pub async fn run(
        self,
        mut shutdown: broadcast::Receiver<()>,
        events: Option<mpsc::Receiver<RecordEvent>>,
    ) {
        let stages = self.build();
        let config = &self.config;
        self.health.register_pipeline().await;

        let mut tasks = JoinSet::new();
        tasks.spawn(stages.scheduler.clone().run(
            self.cluster.clone(),
            config.control_interval,
            shutdown.resubscribe(),
        ));
        for id in 0..config.recommender_workers.max(1) {
            tasks.spawn(run_worker(
                stages.recommender.clone(),
                stages.scheduler.queue().clone(),
                id,
                shutdown.resubscribe(),
                self.health.worker_started(stages.recommender.name()),
            ));
        }
        for id in 0..config.contention_workers.max(1) {
            tasks.spawn(run_worker(
                stages.contention.clone(),
                stages.recommendations.clone(),
                id,
                shutdown.resubscribe(),
                self.health.worker_started(stages.contention.name()),
            ));
        }
        for id in 0..config.updater_workers.max(1) {
            tasks.spawn(run_worker(
                stages.updater.clone(),
                stages.updater.queue().clone(),
                id,
                shutdown.resubscribe(),
                self.health.worker_started(stages.updater.name()),
            ));
        }
        if let Some(events) = events {
            tasks.spawn(forward_record_events(
                stages.recommender.clone(),
                events,
                shutdown.resubscribe(),
            ));
        }

        self.health.set_ready(true).await;
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), stages.recommender.policy_name());
        info!(
            recommender_workers = config.recommender_workers,
            contention_workers = config.contention_workers,
            updater_workers = config.updater_workers,
            queue_capacity = config.queue_capacity,
            "Pipeline running"
        );

        let _ = shutdown.recv().await;
        self.health.set_ready(false).await;

        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Pipeline task failed");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            // Workers blocked on a full queue whose consumers already stopped
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Aborting pipeline tasks still running");
            tasks.shutdown().await;
        }
        let dropped = stages.updater.abandon_retries();
        if dropped > 0 {
            warn!(dropped, "Dropped undelivered update retries");
        }
        info!("Pipeline stopped");
    }
}

/// Evict controller state as records disappear
async fn forward_record_events(
    recommender: Arc<Recommender>,
    mut events: mpsc::Receiver<RecordEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RecordEvent::Deleted(key)) => recommender.evict(&key),
                Some(RecordEvent::Resynced(live)) => recommender.retain_live(&live),
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests;
