//! Common error types for the offline sync core.

use thiserror::Error;

/// Outcome of a failed delivery attempt, as reported by a transport.
///
/// Transports must classify every failure so the sync engine can decide
/// whether to retry. Transports never retry on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network error or server-side failure (5xx). Retried up to the attempt ceiling.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The request did not complete within the configured timeout.
    #[error("Delivery timed out after {0} ms")]
    Timeout(u64),

    /// The server refused the request (validation, 4xx). Never retried.
    #[error("Permanent delivery failure: {message}")]
    Permanent {
        /// HTTP status code, when the transport has one.
        status: Option<u16>,
        /// Server or transport supplied message.
        message: String,
    },
}

impl DeliveryError {
    /// Create a permanent failure without a status code.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            status: None,
            message: message.into(),
        }
    }

    /// Whether this failure may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Top-level error type for offline sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Persistence backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A remote call failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// A service was used before `init` or after `dispose`.
    #[error("Not running: {0}")]
    NotRunning(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
