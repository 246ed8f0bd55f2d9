//! Response-time polling from workload metric endpoints
//!
//! Each workload serves its recent average response time at
//! `GET http://<address>:<port>/metrics/response_time` as
//! `{"response_time": <milliseconds>}`.

use crate::error::ScaleError;
use crate::models::ResponseTimeSample;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Path of the response-time endpoint
pub const RESPONSE_TIME_PATH: &str = "/metrics/response_time";

/// Default port of workload metric endpoints
pub const DEFAULT_METRIC_PORT: u16 = 8080;

/// Default metric fetch timeout
pub const DEFAULT_METRIC_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of response-time samples for a workload address
#[async_trait]
pub trait ResponseTimeSource: Send + Sync {
    async fn response_time(&self, address: &str) -> Result<ResponseTimeSample, ScaleError>;
}

#[derive(Debug, Deserialize)]
struct ResponseTimePayload {
    response_time: Option<f64>,
}

/// Polls workloads over HTTP with a bounded timeout
#[derive(Debug, Clone)]
pub struct HttpMetricSource {
    client: Client,
    port: u16,
}

impl HttpMetricSource {
    pub fn new(port: u16, timeout: Duration) -> Result<Self, ScaleError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ScaleError::Consistency(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, port })
    }

    pub fn endpoint(&self, address: &str) -> String {
        format!("http://{}:{}{}", address, self.port, RESPONSE_TIME_PATH)
    }

    /// Validate a decoded payload into a sample
    fn validate(target: &str, payload: ResponseTimePayload) -> Result<ResponseTimeSample, ScaleError> {
        let malformed = |reason: String| ScaleError::MalformedMetric {
            target: target.to_string(),
            reason,
        };

        let millis = payload
            .response_time
            .ok_or_else(|| malformed("missing response_time field".to_string()))?;
        if !millis.is_finite() || millis <= 0.0 {
            return Err(malformed(format!(
                "response_time must be a positive number, got {}",
                millis
            )));
        }
        Ok(ResponseTimeSample {
            response_time_millis: millis,
        })
    }
}

#[async_trait]
impl ResponseTimeSource for HttpMetricSource {
    async fn response_time(&self, address: &str) -> Result<ResponseTimeSample, ScaleError> {
        let url = self.endpoint(address);
        let fetch_error = |reason: String| ScaleError::MetricFetch {
            target: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("status {}", response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let payload: ResponseTimePayload =
            serde_json::from_slice(&body).map_err(|e| ScaleError::MalformedMetric {
                target: url.clone(),
                reason: e.to_string(),
            })?;

        let sample = Self::validate(&url, payload)?;
        debug!(url = %url, response_time_ms = sample.response_time_millis, "Fetched response time");
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split a mockito `host:port` into the address and a source bound to the port
    fn source_for(server: &mockito::ServerGuard) -> (String, HttpMetricSource) {
        let host_with_port = server.host_with_port();
        let (host, port) = host_with_port.rsplit_once(':').unwrap();
        let source = HttpMetricSource::new(port.parse().unwrap(), Duration::from_secs(2)).unwrap();
        (host.to_string(), source)
    }

    #[tokio::test]
    async fn test_fetch_response_time() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", RESPONSE_TIME_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response_time": 123.5}"#)
            .create_async()
            .await;

        let (host, source) = source_for(&server);
        let sample = source.response_time(&host).await.unwrap();

        assert_eq!(sample.response_time_millis, 123.5);
        assert!((sample.seconds() - 0.1235).abs() < 1e-12);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_field_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", RESPONSE_TIME_PATH)
            .with_status(200)
            .with_body(r#"{"throughput": 10}"#)
            .create_async()
            .await;

        let (host, source) = source_for(&server);
        let err = source.response_time(&host).await.unwrap_err();
        assert!(matches!(err, ScaleError::MalformedMetric { .. }));
    }

    #[tokio::test]
    async fn test_non_json_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", RESPONSE_TIME_PATH)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let (host, source) = source_for(&server);
        let err = source.response_time(&host).await.unwrap_err();
        assert!(matches!(err, ScaleError::MalformedMetric { .. }));
    }

    #[tokio::test]
    async fn test_zero_response_time_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", RESPONSE_TIME_PATH)
            .with_status(200)
            .with_body(r#"{"response_time": 0}"#)
            .create_async()
            .await;

        let (host, source) = source_for(&server);
        assert!(source.response_time(&host).await.is_err());
    }

    #[tokio::test]
    async fn test_server_error_is_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", RESPONSE_TIME_PATH)
            .with_status(503)
            .create_async()
            .await;

        let (host, source) = source_for(&server);
        let err = source.response_time(&host).await.unwrap_err();
        assert!(matches!(err, ScaleError::MetricFetch { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_endpoint_format() {
        let source = HttpMetricSource::new(8080, DEFAULT_METRIC_TIMEOUT).unwrap();
        assert_eq!(
            source.endpoint("10.0.0.7"),
            "http://10.0.0.7:8080/metrics/response_time"
        );
    }
}
