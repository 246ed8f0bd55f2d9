//! Per-record controller state that survives across control cycles

use crate::models::RecordKey;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// Integral accumulator and last core estimate of one container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerState {
    pub integral: f64,
    pub cores: f64,
}

impl ControllerState {
    /// State seeded from a known core estimate (milli-cores)
    pub fn initial(cores: f64) -> Self {
        Self {
            integral: cores,
            cores,
        }
    }
}

/// Keyed store of controller states
///
/// Writers are serialized per key by the node scheduler: a record belongs to
/// one node and a node is processed by at most one worker at a time.
#[derive(Debug, Default)]
pub struct ControllerStateStore {
    states: DashMap<RecordKey, ControllerState>,
    /// Keys of running cycles, flagged once evicted mid-cycle
    in_flight: DashMap<RecordKey, bool>,
}

/// Node cycle holding its keys in flight until committed or dropped
///
/// A key evicted while the cycle runs is not brought back by `commit`.
#[must_use]
pub struct StateCycle<'a> {
    store: &'a ControllerStateStore,
    keys: Vec<RecordKey>,
}

impl StateCycle<'_> {
    /// Store the states computed by the cycle, skipping evicted keys
    pub fn commit(mut self, updates: impl IntoIterator<Item = (RecordKey, ControllerState)>) {
        for (key, state) in updates {
            self.store.states.insert(key.clone(), state);
            // Flag is read after the insert so a concurrent evict always wins
            if let Some((_, true)) = self.store.in_flight.remove(&key) {
                self.store.states.remove(&key);
                debug!(record = %key, "Discarded state of record evicted mid-cycle");
            }
        }
        self.release();
    }

    fn release(&mut self) {
        for key in self.keys.drain(..) {
            self.store.in_flight.remove(&key);
        }
    }
}

impl Drop for StateCycle<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl ControllerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for `key`, or a fresh one from `seed` on first use
    ///
    /// A fresh state is only stored once it is committed.
    pub fn get_or_seed(&self, key: &RecordKey, seed: impl FnOnce() -> ControllerState) -> ControllerState {
        match self.states.get(key) {
            Some(state) => *state,
            None => {
                debug!(record = %key, "Creating controller state");
                seed()
            }
        }
    }

    pub fn get(&self, key: &RecordKey) -> Option<ControllerState> {
        self.states.get(key).map(|s| *s)
    }

    /// Start a node cycle over `keys`
    pub fn begin_cycle(&self, keys: impl IntoIterator<Item = RecordKey>) -> StateCycle<'_> {
        let keys: Vec<RecordKey> = keys.into_iter().collect();
        for key in &keys {
            self.in_flight.insert(key.clone(), false);
        }
        StateCycle { store: self, keys }
    }

    /// Store states outside of a node cycle
    pub fn commit(&self, updates: impl IntoIterator<Item = (RecordKey, ControllerState)>) {
        for (key, state) in updates {
            self.states.insert(key, state);
        }
    }

    /// Drop the state of a deleted record
    pub fn evict(&self, key: &RecordKey) -> Option<ControllerState> {
        if let Some(mut evicted) = self.in_flight.get_mut(key) {
            *evicted = true;
        }
        self.states.remove(key).map(|(_, s)| s)
    }

    /// Drop every state whose key is not in `live`; returns the evicted keys
    pub fn retain_live(&self, live: &[RecordKey]) -> Vec<RecordKey> {
        let live: HashSet<&RecordKey> = live.iter().collect();
        let stale: Vec<RecordKey> = self
            .states
            .iter()
            .filter(|entry| !live.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.evict(key);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
