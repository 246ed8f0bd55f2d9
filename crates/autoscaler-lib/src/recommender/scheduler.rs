//! Periodic node scheduling with per-node deduplication

use crate::cluster::ClusterClient;
use crate::error::ScaleError;
use crate::pipeline::WorkQueue;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Feeds node names into the recommender queue
///
/// A node stays pending from the moment it is queued until the recommender
/// calls [`NodeScheduler::complete`], so at most one recommendation per node
/// is queued or in flight.
pub struct NodeScheduler {
    queue: WorkQueue<String>,
    pending: DashSet<String>,
}

impl NodeScheduler {
    pub fn new(queue: WorkQueue<String>) -> Self {
        Self {
            queue,
            pending: DashSet::new(),
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Queue `node` unless it is already pending; returns whether it was queued
    pub async fn schedule(&self, node: &str) -> Result<bool, ScaleError> {
        if !self.pending.insert(node.to_string()) {
            debug!(node = %node, "Node already pending, skipping");
            return Ok(false);
        }
        if let Err(e) = self.queue.push(node.to_string()).await {
            self.pending.remove(node);
            return Err(e);
        }
        Ok(true)
    }

    /// Release a node once its recommendation finished
    pub fn complete(&self, node: &str) {
        self.pending.remove(node);
    }

    pub fn is_pending(&self, node: &str) -> bool {
        self.pending.contains(node)
    }

    /// List nodes and schedule each; returns the number newly queued
    pub async fn tick(&self, cluster: &dyn ClusterClient) -> usize {
        let nodes = match cluster.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Failed to list nodes");
                return 0;
            }
        };

        let mut scheduled = 0;
        for node in &nodes {
            match self.schedule(node).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to schedule node");
                    break;
                }
            }
        }
        debug!(nodes = nodes.len(), scheduled, "Scheduled control cycle");
        scheduled
    }

    /// Tick every `interval` until shutdown
    pub async fn run(
        self: Arc<Self>,
        cluster: Arc<dyn ClusterClient>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(interval_secs = interval.as_secs_f64(), "Starting node scheduler");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            // A full queue must not hold up shutdown
            tokio::select! {
                _ = self.tick(cluster.as_ref()) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Node scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FaultKind, InMemoryCluster, Operation};
    use crate::cluster::memory::ANY;
    use crate::models::ResourceVector;

    fn cluster_with_nodes(names: &[&str]) -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        for name in names {
            cluster.add_node(name, ResourceVector::new(1000, 1 << 30));
        }
        cluster
    }

    #[tokio::test]
    async fn test_pending_node_is_not_queued_twice() {
        let scheduler = NodeScheduler::new(WorkQueue::bounded("nodes", 8));

        assert!(scheduler.schedule("node-a").await.unwrap());
        assert!(!scheduler.schedule("node-a").await.unwrap());
        assert_eq!(scheduler.queue().len(), 1);

        // Still pending while in flight
        assert_eq!(scheduler.queue().pop().await.as_deref(), Some("node-a"));
        assert!(!scheduler.schedule("node-a").await.unwrap());

        scheduler.complete("node-a");
        assert!(scheduler.schedule("node-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_tick_schedules_every_node_once() {
        let cluster = cluster_with_nodes(&["node-a", "node-b"]);
        let scheduler = NodeScheduler::new(WorkQueue::bounded("nodes", 8));

        assert_eq!(scheduler.tick(&cluster).await, 2);
        assert_eq!(scheduler.tick(&cluster).await, 0);
        assert!(scheduler.is_pending("node-b"));
    }

    #[tokio::test]
    async fn test_tick_survives_list_failure() {
        let cluster = cluster_with_nodes(&["node-a"]);
        cluster.inject_fault(Operation::ListNodes, ANY, FaultKind::Unavailable);
        let scheduler = NodeScheduler::new(WorkQueue::bounded("nodes", 8));

        assert_eq!(scheduler.tick(&cluster).await, 0);
        assert!(scheduler.queue().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_with_full_queue() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(cluster_with_nodes(&["a", "b", "c"]));
        let scheduler = Arc::new(NodeScheduler::new(WorkQueue::bounded("nodes", 1)));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(scheduler.clone().run(
            cluster,
            Duration::from_millis(10),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
