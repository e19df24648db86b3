// Error taxonomy shared by the storage layer and the HTTP handlers
//
// Validation problems (MetricError) are never retried and map to 4xx.
// Storage failures carry a transient/fatal classification so the shared
// Retryer can absorb connection blips before anything reaches the client.

use thiserror::Error;

use crate::retry::{RetryableError, Transient};

/// Problems with a metric supplied by a client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("wrong metric value: {0}")]
    WrongMetricValue(String),

    #[error("invalid metric type: {0}")]
    InvalidMetricType(String),

    #[error("metric name is missing")]
    MissingName,
}

/// Errors returned by every storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error("metric doesn't exist")]
    MetricNotExist,

    /// Backend temporarily unreachable; safe to retry
    #[error("connection exception: {0}")]
    ConnectionException(#[from] RetryableError),

    /// The backend is not an external dependency and can't be pinged
    #[error("storage backend doesn't support ping")]
    PingUnsupported,

    #[error("snapshot file error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Opaque internal failure; the detail is logged, never sent to clients
    #[error("server error: {0}")]
    Server(String),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::ConnectionException(_))
    }
}
