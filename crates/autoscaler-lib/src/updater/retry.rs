//! Bounded retry with exponential backoff and a dead-letter history

use crate::error::ErrorClass;
use crate::models::RecordKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default number of delivery attempts per record
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Number of dead letters kept for inspection
pub const DEAD_LETTER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delivery attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Whether a transient failure at `attempt` earns another delivery
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before redelivering after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut current = self.initial_backoff.min(self.max_backoff);
        for _ in 1..attempt {
            current = (current * 2).min(self.max_backoff);
            if current == self.max_backoff {
                break;
            }
        }
        current
    }
}

/// A record the resource updater gave up on
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub record: RecordKey,
    pub node: String,
    pub attempts: u32,
    pub reason: String,
    #[serde(skip)]
    pub class: ErrorClass,
    pub timestamp: DateTime<Utc>,
}

/// Most recent dead letters, oldest dropped first
#[derive(Debug)]
pub struct DeadLetterLog {
    entries: RwLock<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl Default for DeadLetterLog {
    fn default() -> Self {
        Self::with_capacity(DEAD_LETTER_CAPACITY)
    }
}

impl DeadLetterLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEAD_LETTER_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub async fn push(&self, letter: DeadLetter) {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    /// Dead letters, oldest first
    pub async fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
