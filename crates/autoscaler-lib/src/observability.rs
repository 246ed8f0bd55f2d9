//! Observability infrastructure for the autoscaler
//!
//! Provides:
//! - Prometheus metrics (stage latencies, batch and update counters, retry and dead-letter counts)
//! - Structured JSON logging of domain events with tracing

use crate::models::{BoundFlags, RecordKey, ResourceKind, ResourceVector};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for stage latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    recommendation_latency_seconds: Histogram,
    update_latency_seconds: Histogram,
    batches_emitted: IntCounter,
    node_cycle_failures: IntCounter,
    empty_node_cycles: IntCounter,
    oversubscribed: IntCounterVec,
    status_write_failures: IntCounter,
    updates_applied: IntCounter,
    updates_failed: IntCounter,
    retries_scheduled: IntCounter,
    dead_letters: IntCounter,
    controller_states: IntGauge,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            recommendation_latency_seconds: register_histogram!(
                "sla_autoscaler_recommendation_latency_seconds",
                "Time spent computing the recommendations of one node",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register recommendation_latency_seconds"),

            update_latency_seconds: register_histogram!(
                "sla_autoscaler_update_latency_seconds",
                "Time spent applying one record to its pod",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register update_latency_seconds"),

            batches_emitted: register_int_counter!(
                "sla_autoscaler_batches_emitted_total",
                "Node batches handed to contention resolution"
            )
            .expect("Failed to register batches_emitted"),

            node_cycle_failures: register_int_counter!(
                "sla_autoscaler_node_cycle_failures_total",
                "Node cycles aborted by the recommender or contention manager"
            )
            .expect("Failed to register node_cycle_failures"),

            empty_node_cycles: register_int_counter!(
                "sla_autoscaler_empty_node_cycles_total",
                "Node cycles that found no tracking records"
            )
            .expect("Failed to register empty_node_cycles"),

            oversubscribed: register_int_counter_vec!(
                "sla_autoscaler_oversubscribed_total",
                "Node batches whose desired total exceeded capacity",
                &["resource"]
            )
            .expect("Failed to register oversubscribed"),

            status_write_failures: register_int_counter!(
                "sla_autoscaler_status_write_failures_total",
                "Failed tracking record status writes"
            )
            .expect("Failed to register status_write_failures"),

            updates_applied: register_int_counter!(
                "sla_autoscaler_updates_applied_total",
                "Records applied to their pods"
            )
            .expect("Failed to register updates_applied"),

            updates_failed: register_int_counter!(
                "sla_autoscaler_updates_failed_total",
                "Record applications that failed"
            )
            .expect("Failed to register updates_failed"),

            retries_scheduled: register_int_counter!(
                "sla_autoscaler_retries_scheduled_total",
                "Update batches resubmitted after a transient failure"
            )
            .expect("Failed to register retries_scheduled"),

            dead_letters: register_int_counter!(
                "sla_autoscaler_dead_letters_total",
                "Records abandoned by the resource updater"
            )
            .expect("Failed to register dead_letters"),

            controller_states: register_int_gauge!(
                "sla_autoscaler_controller_states",
                "Controller states currently tracked"
            )
            .expect("Failed to register controller_states"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a handle, registering the global metrics on first call
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn observe_recommendation_latency(&self, duration_secs: f64) {
        self.inner().recommendation_latency_seconds.observe(duration_secs);
    }

    pub fn observe_update_latency(&self, duration_secs: f64) {
        self.inner().update_latency_seconds.observe(duration_secs);
    }

    pub fn inc_batches_emitted(&self) {
        self.inner().batches_emitted.inc();
    }

    pub fn inc_node_cycle_failures(&self) {
        self.inner().node_cycle_failures.inc();
    }

    pub fn inc_empty_node_cycles(&self) {
        self.inner().empty_node_cycles.inc();
    }

    pub fn empty_node_cycles(&self) -> u64 {
        self.inner().empty_node_cycles.get()
    }

    pub fn inc_oversubscribed(&self, kind: ResourceKind) {
        self.inner()
            .oversubscribed
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_status_write_failures(&self) {
        self.inner().status_write_failures.inc();
    }

    pub fn inc_updates_applied(&self) {
        self.inner().updates_applied.inc();
    }

    pub fn inc_updates_failed(&self) {
        self.inner().updates_failed.inc();
    }

    pub fn inc_retries_scheduled(&self) {
        self.inner().retries_scheduled.inc();
    }

    pub fn inc_dead_letters(&self) {
        self.inner().dead_letters.inc();
    }

    pub fn set_controller_states(&self, count: i64) {
        self.inner().controller_states.set(count);
    }
}

/// Structured logger for autoscaler events
///
/// Emits the significant domain events with a fixed `event` field so they can
/// be filtered out of the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn log_startup(&self, version: &str, policy: &str) {
        info!(
            event = "autoscaler_started",
            instance = %self.instance,
            autoscaler_version = %version,
            policy = %policy,
            "SLA autoscaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "SLA autoscaler shutting down"
        );
    }

    /// Log a recommendation for one record
    pub fn log_recommendation(
        &self,
        record: &RecordKey,
        node: &str,
        measured_millis: f64,
        target_millis: f64,
        desired: ResourceVector,
    ) {
        info!(
            event = "recommendation_computed",
            instance = %self.instance,
            record = %record,
            node = %node,
            measured_response_time_ms = measured_millis,
            target_response_time_ms = target_millis,
            desired_cpu_millicores = desired.cpu_millicores,
            desired_memory_bytes = desired.memory_bytes,
            "Computed resource recommendation"
        );
    }

    /// Log the outcome of contention resolution on a node
    pub fn log_arbitration(
        &self,
        node: &str,
        capacity: ResourceVector,
        desired_total: ResourceVector,
        oversubscribed: BoundFlags,
        records: usize,
    ) {
        info!(
            event = "node_arbitrated",
            instance = %self.instance,
            node = %node,
            capacity_cpu_millicores = capacity.cpu_millicores,
            capacity_memory_bytes = capacity.memory_bytes,
            desired_cpu_millicores = desired_total.cpu_millicores,
            desired_memory_bytes = desired_total.memory_bytes,
            cpu_oversubscribed = oversubscribed.cpu,
            memory_oversubscribed = oversubscribed.memory,
            records = records,
            "Resolved node contention"
        );
    }

    pub fn log_applied(&self, record: &RecordKey, pod: &str, actual: ResourceVector) {
        info!(
            event = "resources_applied",
            instance = %self.instance,
            record = %record,
            pod = %pod,
            cpu_millicores = actual.cpu_millicores,
            memory_bytes = actual.memory_bytes,
            "Applied resources to pod"
        );
    }

    pub fn log_dead_letter(&self, record: &RecordKey, node: &str, attempts: u32, reason: &str) {
        warn!(
            event = "update_dead_lettered",
            instance = %self.instance,
            record = %record,
            node = %node,
            attempts = attempts,
            reason = %reason,
            "Gave up applying record"
        );
    }

    pub fn log_state_evicted(&self, record: &RecordKey, cause: &str) {
        info!(
            event = "controller_state_evicted",
            instance = %self.instance,
            record = %record,
            cause = %cause,
            "Evicted controller state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics_handles_share_registry() {
        let metrics = PipelineMetrics::new();
        let other = metrics.clone();

        metrics.observe_recommendation_latency(0.01);
        metrics.observe_update_latency(0.02);
        metrics.inc_oversubscribed(ResourceKind::Cpu);
        other.inc_dead_letters();
        other.set_controller_states(3);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "sla_autoscaler_oversubscribed_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("autoscaler-0");
        assert_eq!(logger.instance(), "autoscaler-0");
    }
}
