//! Controller configuration

use anyhow::{Context, Result};
use autoscaler_lib::metric_source::DEFAULT_METRIC_PORT;
use autoscaler_lib::pipeline::{PipelineConfig, DEFAULT_QUEUE_CAPACITY};
use autoscaler_lib::updater::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "AUTOSCALER_CONFIG_FILE";

/// Controller configuration
///
/// Read from `AUTOSCALER_*` environment variables, optionally layered over a
/// file named by `AUTOSCALER_CONFIG_FILE`.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Instance name in logs, from the downward API when available
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    #[serde(default = "default_control_interval")]
    pub control_interval_secs: u64,

    #[serde(default = "default_recommender_workers")]
    pub recommender_workers: usize,

    #[serde(default = "default_stage_workers")]
    pub contention_workers: usize,

    #[serde(default = "default_stage_workers")]
    pub updater_workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Port of the workloads' metric endpoints
    #[serde(default = "default_metric_port")]
    pub metric_port: u16,

    #[serde(default = "default_metric_timeout")]
    pub metric_timeout_millis: u64,

    /// Audit log of applied records; disabled when unset
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_millis: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_secs: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_instance_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "sla-autoscaler".to_string())
}

fn default_control_interval() -> u64 {
    5
}

fn default_recommender_workers() -> usize {
    4
}

fn default_stage_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_metric_port() -> u16 {
    DEFAULT_METRIC_PORT
}

fn default_metric_timeout() -> u64 {
    2000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_initial_backoff() -> u64 {
    1000
}

fn default_retry_max_backoff() -> u64 {
    60
}

impl AutoscalerConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let builder = builder.add_source(config::Environment::with_prefix("AUTOSCALER"));
        Self::from_builder(builder)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config = builder.build().context("failed to read configuration")?;
        let parsed: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.control_interval_secs > 0, "control_interval_secs must be positive");
        anyhow::ensure!(self.queue_capacity > 0, "queue_capacity must be positive");
        anyhow::ensure!(self.retry_max_attempts > 0, "retry_max_attempts must be positive");
        Ok(())
    }

    pub fn metric_timeout(&self) -> Duration {
        Duration::from_millis(self.metric_timeout_millis)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            instance_name: self.instance_name.clone(),
            control_interval: Duration::from_secs(self.control_interval_secs),
            recommender_workers: self.recommender_workers,
            contention_workers: self.contention_workers,
            updater_workers: self.updater_workers,
            queue_capacity: self.queue_capacity,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_millis),
                max_backoff: Duration::from_secs(self.retry_max_backoff_secs),
            },
            audit_log_path: self.audit_log_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn parse(toml: &str) -> Result<AutoscalerConfig> {
        AutoscalerConfig::from_builder(
            config::Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.control_interval_secs, 5);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.metric_timeout(), Duration::from_secs(2));
        assert!(config.audit_log_path.is_none());

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.recommender_workers, 4);
        assert_eq!(pipeline.updater_workers, 2);
        assert_eq!(pipeline.retry, RetryPolicy::default());
    }

    #[test]
    fn test_overrides() {
        let config = parse(
            r#"
            control_interval_secs = 10
            updater_workers = 8
            audit_log_path = "/var/log/autoscaler/audit.log"
            retry_max_backoff_secs = 30
            "#,
        )
        .unwrap();

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.control_interval, Duration::from_secs(10));
        assert_eq!(pipeline.updater_workers, 8);
        assert_eq!(pipeline.retry.max_backoff, Duration::from_secs(30));
        assert_eq!(
            pipeline.audit_log_path,
            Some(PathBuf::from("/var/log/autoscaler/audit.log"))
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(parse("control_interval_secs = 0").is_err());
    }
}
