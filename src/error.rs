//! Error taxonomy for the monitoring pipeline.
//!
//! Adapter and consumer failures are contained where they happen and only
//! logged; none of these errors is allowed to stop another task. Startup code
//! wraps them in `anyhow` instead.

use std::time::Duration;

/// Failure to produce a sample from a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// A single failed hardware read; retried on the next cycle.
    #[error("transient read failure: {0}")]
    TransientRead(String),

    /// Input arrived but could not be understood.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Nothing arrived within the read timeout.
    #[error("no data within {0:?}")]
    Timeout(Duration),

    /// The underlying channel was closed; the source cannot produce more data.
    #[error("source channel closed")]
    Closed,
}

/// Notifier or actuator I/O failure. Retried briefly, then dropped.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{backend}: HTTP request failed: {source}")]
    Http {
        backend: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend}: endpoint returned status {status}: {body}")]
    Rejected {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("smtp: {0}")]
    Smtp(String),

    #[error("device {host}: {message}")]
    Device { host: String, message: String },

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// Invalid configuration, rejected at the configuration boundary.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("unknown notification backend '{0}'")]
    UnknownBackend(String),

    #[error("{backend} enabled but missing: {missing}")]
    MissingCredentials {
        backend: &'static str,
        missing: String,
    },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Reading store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("settings payload: {0}")]
    Json(#[from] serde_json::Error),
}
