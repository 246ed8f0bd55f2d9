//! Error taxonomy of the autoscaling pipeline

use crate::models::ResourceKind;
use thiserror::Error;

/// How a failure should be handled by the stage that observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// External dependency failed; retrying may succeed
    Transient,
    /// Input violates a requirement; retrying cannot succeed
    Precondition,
    /// Internal invariant broken
    Consistency,
}

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("metric fetch from {target} failed: {reason}")]
    MetricFetch { target: String, reason: String },

    #[error("malformed metric payload from {target}: {reason}")]
    MalformedMetric { target: String, reason: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflicting update of {kind} {name}")]
    Conflict { kind: &'static str, name: String },

    #[error("cluster API request failed: {0}")]
    Api(String),

    #[error("no tracking records on node {node}")]
    NoRecords { node: String },

    #[error("precondition failed for {target}: {reason}")]
    Precondition { target: String, reason: String },

    #[error("invalid {kind} bounds: min {min} > max {max}")]
    InvalidBounds { kind: ResourceKind, min: i64, max: i64 },

    #[error("invalid quantity {value:?}: {reason}")]
    InvalidQuantity { value: String, reason: String },

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("queue closed: {0}")]
    QueueClosed(&'static str),
}

impl ScaleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ScaleError::MetricFetch { .. }
            | ScaleError::MalformedMetric { .. }
            | ScaleError::NotFound { .. }
            | ScaleError::Conflict { .. }
            | ScaleError::Api(_)
            | ScaleError::NoRecords { .. } => ErrorClass::Transient,
            ScaleError::Precondition { .. }
            | ScaleError::InvalidBounds { .. }
            | ScaleError::InvalidQuantity { .. } => ErrorClass::Precondition,
            ScaleError::Consistency(_) | ScaleError::QueueClosed(_) => ErrorClass::Consistency,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map a kube client error for an object of the given kind
    pub fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ScaleError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => ScaleError::Conflict {
                kind,
                name: name.to_string(),
            },
            // Admission and validation rejections, including dry runs
            kube::Error::Api(resp) if resp.code == 422 || resp.code == 403 => {
                ScaleError::Precondition {
                    target: format!("{} {}", kind, name),
                    reason: resp.message,
                }
            }
            other => ScaleError::Api(format!("{} {}: {}", kind, name, other)),
        }
    }
}
