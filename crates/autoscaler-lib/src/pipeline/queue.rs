//! Bounded work queues shared by a pool of workers

use crate::error::ScaleError;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Default capacity of the inter-stage queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Multi-producer, multi-consumer bounded queue
///
/// Pushing into a full queue waits for space; nothing is dropped.
pub struct WorkQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn push(&self, item: T) -> Result<(), ScaleError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| ScaleError::QueueClosed(self.name))
    }

    /// Wait for the next item; `None` once every sender is gone
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Take an item if one is ready without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_pop_in_order() {
        let queue = WorkQueue::bounded("test", 4);
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_push() {
        let queue = WorkQueue::bounded("test", 1);
        queue.push(1).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(2)).await;
        assert!(blocked.is_err(), "push into a full queue must wait");

        assert_eq!(queue.pop().await, Some(1));
        queue.push(3).await.unwrap();
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_clones_share_items() {
        let producer = WorkQueue::bounded("test", 2);
        let consumer = producer.clone();
        producer.push("node-a".to_string()).await.unwrap();
        assert_eq!(consumer.pop().await.as_deref(), Some("node-a"));
    }
}
