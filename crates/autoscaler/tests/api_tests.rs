//! Integration tests for the autoscaler API endpoints

#[allow(dead_code)]
#[path = "../src/api.rs"]
mod api;

use api::{create_router, AppState};
use autoscaler_lib::{
    health::{components, HealthRegistry, WorkerGuard},
    observability::PipelineMetrics,
    ResourceKind,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register_pipeline().await;

    let metrics = PipelineMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

/// Mark the pipeline started with one worker per stage
async fn start_pipeline(state: &AppState) -> Vec<WorkerGuard> {
    let guards = components::ALL
        .iter()
        .map(|stage| state.health_registry.worker_started(stage))
        .collect();
    state.health_registry.set_ready(true).await;
    guards
}

async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn scrape(app: Router) -> String {
    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::RECOMMENDER, "node-a: metric endpoint timed out")
        .await;

    let (status, health) = get(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["recommender"]["message"],
        "node-a: metric endpoint timed out"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::RESOURCE_UPDATER, "API server unreachable")
        .await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_pipeline_starts() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "Pipeline not yet started");
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    let _workers = start_pipeline(&state).await;

    let (status, readiness) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_stage_pool_is_gone() {
    let (app, state) = setup_test_app().await;
    let mut workers = start_pipeline(&state).await;
    // Last guard belongs to the resource updater
    workers.pop();

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "No live workers for resource_updater");

    let (status, health) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["components"]["resource_updater"]["live_workers"], 0);
    assert_eq!(health["components"]["recommender"]["live_workers"], 1);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    let _workers = start_pipeline(&state).await;
    state
        .health_registry
        .set_unhealthy(components::CONTENTION_MANAGER, "Failed")
        .await;

    let (status, readiness) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Pipeline stage unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_recommendation_latency(0.002);
    state.metrics.inc_batches_emitted();
    state.metrics.inc_oversubscribed(ResourceKind::Cpu);
    state.metrics.inc_updates_applied();
    state.metrics.set_controller_states(3);

    let metrics_text = scrape(app).await;

    assert!(metrics_text.contains("sla_autoscaler_recommendation_latency_seconds"));
    assert!(metrics_text.contains("sla_autoscaler_batches_emitted_total"));
    assert!(metrics_text.contains("sla_autoscaler_oversubscribed_total{resource=\"cpu\"}"));
    assert!(metrics_text.contains("sla_autoscaler_updates_applied_total"));
    assert!(metrics_text.contains("sla_autoscaler_controller_states"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_update_latency(0.01);
    state.metrics.observe_update_latency(0.05);
    state.metrics.observe_update_latency(0.2);

    let metrics_text = scrape(app).await;

    assert!(metrics_text.contains("sla_autoscaler_update_latency_seconds_bucket"));
    assert!(metrics_text.contains("sla_autoscaler_update_latency_seconds_count"));
    assert!(metrics_text.contains("sla_autoscaler_update_latency_seconds_sum"));
}

#[tokio::test]
async fn test_healthz_includes_every_stage() {
    let (app, _state) = setup_test_app().await;

    let (_, health) = get(app, "/healthz").await;

    assert!(health["components"].is_object());
    for name in components::ALL {
        assert!(health["components"][name].is_object(), "missing {name}");
    }
}
