//! Worker loop shared by every pipeline stage

use super::WorkQueue;
use crate::health::WorkerGuard;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// A pipeline stage processing one queue item at a time
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Item: Send + 'static;

    fn name(&self) -> &'static str;

    /// Process one item; failures are handled and reported by the stage
    async fn handle(&self, item: Self::Item);
}

/// Pop and handle items until shutdown
///
/// Shutdown is only observed between items, so an item being handled always
/// runs to completion. `live` keeps the worker counted in its stage pool until
/// the loop ends.
pub async fn run_worker<S: Stage>(
    stage: Arc<S>,
    queue: WorkQueue<S::Item>,
    worker_id: usize,
    mut shutdown: broadcast::Receiver<()>,
    live: WorkerGuard,
) {
    debug!(stage = stage.name(), worker_id, "Worker started");

    loop {
        let item = tokio::select! {
            item = queue.pop() => item,
            _ = shutdown.recv() => break,
        };

        match item {
            Some(item) => stage.handle(item).await,
            None => break,
        }
    }

    drop(live);
    debug!(stage = stage.name(), worker_id, "Worker stopped");
}
