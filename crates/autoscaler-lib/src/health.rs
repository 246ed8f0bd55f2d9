//! Component health of the pipeline stages
//!
//! Backs the controller's liveness and readiness probes. Besides the status
//! each stage reports after handling an item, the registry counts the live
//! workers of every stage pool: a started pipeline is only ready while every
//! registered stage has at least one worker.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
    /// Workers of the stage pool currently running
    #[serde(default)]
    pub live_workers: usize,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
            live_workers: 0,
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Compute overall status from component statuses
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResponse {
    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

/// Component names for health tracking
pub mod components {
    pub const RECOMMENDER: &str = "recommender";
    pub const CONTENTION_MANAGER: &str = "contention_manager";
    pub const RESOURCE_UPDATER: &str = "resource_updater";

    pub const ALL: [&str; 3] = [RECOMMENDER, CONTENTION_MANAGER, RESOURCE_UPDATER];
}

/// Keeps one worker of a stage pool counted as live until dropped
///
/// Dropped when the worker returns or its task is aborted or panics.
#[must_use]
#[derive(Debug)]
pub struct WorkerGuard {
    workers: Arc<DashMap<String, usize>>,
    stage: String,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(mut live) = self.workers.get_mut(&self.stage) {
            *live = live.saturating_sub(1);
        }
    }
}

/// Health registry of the pipeline stages
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    workers: Arc<DashMap<String, usize>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(DashMap::new()),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Register every pipeline stage
    pub async fn register_pipeline(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    /// Current status of one component
    pub async fn status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|h| h.status)
    }

    /// Count a worker of `stage` as live for the lifetime of the guard
    pub fn worker_started(&self, stage: &str) -> WorkerGuard {
        *self.workers.entry(stage.to_string()).or_insert(0) += 1;
        WorkerGuard {
            workers: self.workers.clone(),
            stage: stage.to_string(),
        }
    }

    pub fn live_workers(&self, stage: &str) -> usize {
        self.workers.get(stage).map(|live| *live).unwrap_or(0)
    }

    /// Update component health status
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    /// Mark component as healthy
    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Mark component as degraded
    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    /// Mark component as unhealthy
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Set readiness status
    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    /// Get health response
    ///
    /// While the pipeline runs, a stage whose pool has no live worker left is
    /// reported unhealthy whatever it last reported itself.
    pub async fn health(&self) -> HealthResponse {
        let ready = *self.ready.read().await;
        let mut components = self.components.read().await.clone();
        for (name, health) in components.iter_mut() {
            health.live_workers = self.live_workers(name);
            if ready && health.live_workers == 0 {
                health.status = ComponentStatus::Unhealthy;
                health.message = Some("No live workers".to_string());
            }
        }
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Get readiness response
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse::not_ready("Pipeline not yet started");
        }

        let health = self.health().await;
        let mut stopped: Vec<&str> = health
            .components
            .iter()
            .filter(|(_, h)| h.live_workers == 0)
            .map(|(name, _)| name.as_str())
            .collect();
        if !stopped.is_empty() {
            stopped.sort_unstable();
            return ReadinessResponse::not_ready(format!(
                "No live workers for {}",
                stopped.join(", ")
            ));
        }

        if health.status == ComponentStatus::Unhealthy {
            return ReadinessResponse::not_ready("Pipeline stage unhealthy");
        }

        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}
