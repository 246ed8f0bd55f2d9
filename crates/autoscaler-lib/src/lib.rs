//! SLA-driven container autoscaling pipeline
//!
//! This crate provides the core functionality for:
//! - Feedback-controlled CPU recommendations from workload response times
//! - Proportional arbitration of oversubscribed node capacity
//! - Dry-run validated, compensated updates of pods and tracking records
//! - Health checks and observability

pub mod cluster;
pub mod contention;
pub mod crd;
pub mod error;
pub mod health;
pub mod metric_source;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod quantity;
pub mod recommender;
pub mod updater;

pub use error::{ErrorClass, ScaleError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{Pipeline, PipelineConfig};
