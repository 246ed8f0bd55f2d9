//! SLA Autoscaler - response-time driven container resource controller
//!
//! Runs the recommender, contention manager and resource updater against
//! the cluster, and serves health and metrics endpoints.

use anyhow::{Context, Result};
use autoscaler_lib::{
    cluster::KubeCluster,
    health::HealthRegistry,
    metric_source::HttpMetricSource,
    observability::{PipelineMetrics, StructuredLogger},
    pipeline::Pipeline,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

/// Buffer of record lifecycle events between the watcher and the pipeline
const RECORD_EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting sla-autoscaler");

    let config = config::AutoscalerConfig::load()?;
    info!(
        instance = %config.instance_name,
        control_interval_secs = config.control_interval_secs,
        "Autoscaler configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = PipelineMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster = KubeCluster::new(client);

    let (event_tx, event_rx) = mpsc::channel(RECORD_EVENT_BUFFER);
    let watcher_handle = cluster.spawn_record_watcher(event_tx);

    let source = HttpMetricSource::new(config.metric_port, config.metric_timeout())
        .context("failed to create metric source")?;

    let pipeline = Pipeline::new(config.pipeline_config(), Arc::new(cluster), Arc::new(source))
        .with_health(health_registry.clone());

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry, metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let pipeline_handle = tokio::spawn(pipeline.run(shutdown_rx, Some(event_rx)));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    if let Err(e) = pipeline_handle.await {
        error!(error = %e, "Pipeline task failed");
    }
    watcher_handle.abort();
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
