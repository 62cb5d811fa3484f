//! Error types for the adapter runtime

use crate::lifecycle::AdapterState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Adapter errors
///
/// Protocol bindings translate every failure of their underlying client
/// library into one of these variants before returning to the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration (fatal, surfaced at initialize)
    #[error("Configuration error in '{field}': {reason}")]
    Configuration {
        /// Offending configuration field (camelCase option name)
        field: String,
        /// Reason
        reason: String,
    },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication rejected by the endpoint
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Payload or content invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation-specific failure (e.g. atomic rename failure)
    #[error("Processing error: {0}")]
    Processing(String),

    /// Timeout
    #[error("Timeout after {millis}ms: {operation}")]
    Timeout {
        /// Timeout duration
        millis: u64,
        /// Operation
        operation: String,
    },

    /// Operation not permitted in the current lifecycle state
    #[error("Cannot {operation} while adapter is {state}")]
    InvalidState {
        /// Operation attempted
        operation: String,
        /// Current state
        state: AdapterState,
    },

    /// Circuit breaker open
    #[error("Circuit breaker open for adapter {adapter}: {reason}")]
    CircuitBreakerOpen {
        /// Adapter ID
        adapter: String,
        /// Reason
        reason: String,
    },

    /// Capability not offered by the binding
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error
    #[error("Adapter error: {0}")]
    Generic(String),
}

/// Error classification consumed by the flow engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Fatal configuration problem, never retried automatically
    Configuration,
    /// Transient connection problem, eligible for reconnect-and-retry
    Connection,
    /// Credentials rejected, needs operator intervention
    Authentication,
    /// Item rejected, not retried
    Validation,
    /// Operation-specific failure
    Processing,
    /// Transient timeout
    Timeout,
}

impl Error {
    /// Build a configuration error for `field`
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build a timeout error
    pub fn timeout(millis: u64, operation: impl Into<String>) -> Self {
        Error::Timeout {
            millis,
            operation: operation.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Connection(_) | Error::CircuitBreakerOpen { .. } => ErrorKind::Connection,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Toml(_) => ErrorKind::Configuration,
            Error::Processing(_)
            | Error::InvalidState { .. }
            | Error::Unsupported(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Generic(_) => ErrorKind::Processing,
        }
    }

    /// Whether the caller may reconnect and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout { .. })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "CONFIG_ERROR"),
            ErrorKind::Connection => write!(f, "CONNECTION_ERROR"),
            ErrorKind::Authentication => write!(f, "AUTH_ERROR"),
            ErrorKind::Validation => write!(f, "VALIDATION_ERROR"),
            ErrorKind::Processing => write!(f, "PROCESSING_ERROR"),
            ErrorKind::Timeout => write!(f, "TIMEOUT_ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::Connection("refused".into()).is_retryable());
        assert!(Error::timeout(500, "fetch").is_retryable());
        assert!(!Error::Authentication("bad password".into()).is_retryable());
        assert!(!Error::config("batchSize", "required").is_retryable());
        assert!(!Error::Validation("empty".into()).is_retryable());
    }

    #[test]
    fn test_configuration_error_names_field() {
        let err = Error::config("batchSize", "required for size strategy");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("batchSize"));
    }

    #[test]
    fn test_io_maps_to_processing() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Processing);
    }
}
