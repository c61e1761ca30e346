//! Error Module
//!
//! Defines the error type and result alias used throughout the relay.

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the relay
///
/// Payloads are plain strings so the error can be cloned and fanned out to
/// every subscriber of a shared remote fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream temporarily unavailable: {0}")]
    TransientUpstream(String),

    #[error("Cache write error: {0}")]
    CacheWrite(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Staged write already in progress for {0}")]
    AlreadyInProgress(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RelayError {
    /// HTTP status the boundary should answer with when this error occurs
    /// before any body byte has been sent.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::TransientUpstream(_) | RelayError::TimeoutError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a clean cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled(_))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for RelayError {
    fn from(err: hyper::Error) -> Self {
        RelayError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, RelayError>;
