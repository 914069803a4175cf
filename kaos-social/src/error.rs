//! Error types for the social client.

use thiserror::Error;

/// Result type for social client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Social client errors.
///
/// Expected conditions (not connected, not the owner, data not populated
/// yet) are reported through `false`/`None`/defaults by the views; these
/// variants only cross the public surface where a caller has to react.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend session is not open.
    #[error("Not connected to backend")]
    NotConnected,

    /// Pending request was cancelled because its view was torn down.
    #[error("Request cancelled")]
    Cancelled,

    /// Duplicate or unexpected completion/notification.
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// Completion payload does not match the request it resolves.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Backend refused to accept a request.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Client was assembled with missing or invalid settings.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client must be built inside a tokio runtime.
    #[error("No tokio runtime available")]
    NoRuntime,
}

impl Error {
    pub fn protocol_anomaly(reason: impl Into<String>) -> Self {
        Self::ProtocolAnomaly(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}
