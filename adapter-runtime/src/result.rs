//! Uniform operation result envelope
//!
//! Every public operation of the runtime returns an [`OperationResult`];
//! protocol failures never escape as `Err`.

use crate::{Error, ErrorKind};
use serde::Serialize;
use serde_json::Value;

/// Insertion-ordered metadata map
pub type Metadata = serde_json::Map<String, Value>;

/// Outcome kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutcomeKind {
    /// Operation succeeded
    Success,
    /// Some items succeeded, some failed
    PartialSuccess,
    /// Generic failure
    Failure,
    /// Endpoint unreachable or session lost
    ConnectionError,
    /// Credentials rejected
    AuthenticationError,
    /// Payload rejected
    ValidationError,
    /// Operation exceeded its deadline
    Timeout,
}

impl OutcomeKind {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::PartialSuccess => "partial_success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::ConnectionError => "connection_error",
            OutcomeKind::AuthenticationError => "authentication_error",
            OutcomeKind::ValidationError => "validation_error",
            OutcomeKind::Timeout => "timeout",
        }
    }
}

impl From<ErrorKind> for OutcomeKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Connection => OutcomeKind::ConnectionError,
            ErrorKind::Authentication => OutcomeKind::AuthenticationError,
            ErrorKind::Validation => OutcomeKind::ValidationError,
            ErrorKind::Timeout => OutcomeKind::Timeout,
            ErrorKind::Configuration | ErrorKind::Processing => OutcomeKind::Failure,
        }
    }
}

/// Result of a single adapter operation
///
/// Immutable once built: the `with_*` methods consume and return `self`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult<T> {
    kind: OutcomeKind,
    message: String,
    payload: Option<T>,
    cause: Option<String>,
    error_kind: Option<ErrorKind>,
    metadata: Metadata,
    duration_ms: Option<u64>,
}

impl<T> OperationResult<T> {
    fn build(kind: OutcomeKind, message: String, payload: Option<T>) -> Self {
        Self {
            kind,
            message,
            payload,
            cause: None,
            error_kind: None,
            metadata: Metadata::new(),
            duration_ms: None,
        }
    }

    /// Successful result carrying `payload`
    pub fn success(payload: T, message: impl Into<String>) -> Self {
        Self::build(OutcomeKind::Success, message.into(), Some(payload))
    }

    /// Partial success: some units of work failed
    pub fn partial_success(payload: T, message: impl Into<String>) -> Self {
        Self::build(OutcomeKind::PartialSuccess, message.into(), Some(payload))
    }

    /// Generic failure
    pub fn failure(message: impl Into<String>) -> Self {
        Self::build(OutcomeKind::Failure, message.into(), None)
    }

    /// Connection failure with its cause
    pub fn connection_error(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::build(OutcomeKind::ConnectionError, message.into(), None).with_cause(cause)
    }

    /// Authentication failure
    pub fn authentication_error(message: impl Into<String>) -> Self {
        Self::build(OutcomeKind::AuthenticationError, message.into(), None)
    }

    /// Validation failure
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::build(OutcomeKind::ValidationError, message.into(), None)
    }

    /// Timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::build(OutcomeKind::Timeout, message.into(), None)
    }

    /// Translate a runtime error into an envelope
    pub fn from_error(context: &str, error: &Error) -> Self {
        let kind = error.kind();
        let mut result = Self::build(
            kind.into(),
            format!("{} failed: {}", context, error),
            None,
        )
        .with_cause(error.to_string());
        result.error_kind = Some(kind);
        result
    }

    /// Attach a payload to a failure (e.g. a connection report)
    pub fn with_payload(mut self, payload: T) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Attach a metadata entry (insertion order preserved)
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach the operation duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Outcome kind
    pub fn kind(&self) -> OutcomeKind {
        self.kind
    }

    /// True for `Success` and `PartialSuccess`
    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Success | OutcomeKind::PartialSuccess)
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Payload, if any
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    /// Take ownership of the payload
    pub fn into_payload(self) -> Option<T> {
        self.payload
    }

    /// Underlying cause, if any
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Error classification for failures built from an [`Error`]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Metadata map
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Single metadata entry
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Duration in milliseconds, when timed
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Map the payload, keeping everything else
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            kind: self.kind,
            message: self.message,
            payload: self.payload.map(f),
            cause: self.cause,
            error_kind: self.error_kind,
            metadata: self.metadata,
            duration_ms: self.duration_ms,
        }
    }
}
