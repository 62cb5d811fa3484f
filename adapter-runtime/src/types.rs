//! Shared types for adapters

use crate::{lifecycle::AdapterState, result::Metadata};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Adapter type (protocol family)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    /// Local or mounted filesystem
    File,
    /// FTP server
    Ftp,
    /// SFTP server
    Sftp,
    /// Relational database
    Jdbc,
    /// Mail server (SMTP/IMAP/POP3)
    Mail,
    /// Message queue
    Jms,
    /// Plain HTTP endpoint
    Http,
    /// REST API
    Rest,
    /// SOAP service
    Soap,
    /// OData service
    Odata,
    /// Simulated SAP RFC
    Rfc,
    /// Simulated SAP IDoc
    Idoc,
    /// Custom binding
    Custom,
}

impl std::fmt::Display for AdapterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterType::File => write!(f, "FILE"),
            AdapterType::Ftp => write!(f, "FTP"),
            AdapterType::Sftp => write!(f, "SFTP"),
            AdapterType::Jdbc => write!(f, "JDBC"),
            AdapterType::Mail => write!(f, "MAIL"),
            AdapterType::Jms => write!(f, "JMS"),
            AdapterType::Http => write!(f, "HTTP"),
            AdapterType::Rest => write!(f, "REST"),
            AdapterType::Soap => write!(f, "SOAP"),
            AdapterType::Odata => write!(f, "ODATA"),
            AdapterType::Rfc => write!(f, "RFC"),
            AdapterType::Idoc => write!(f, "IDOC"),
            AdapterType::Custom => write!(f, "CUSTOM"),
        }
    }
}

/// Adapter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Inbound: pulls data from the external system
    Sender,
    /// Outbound: pushes data to the external system
    Receiver,
}

impl std::fmt::Display for AdapterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterMode::Sender => write!(f, "SENDER"),
            AdapterMode::Receiver => write!(f, "RECEIVER"),
        }
    }
}

/// Item fetched by an inbound binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Natural key (file name, primary key, message id)
    pub key: String,
    /// Raw content
    pub content: Bytes,
    /// Structured fields (row columns, file attributes)
    pub fields: Metadata,
}

impl RawItem {
    /// Create an item without fields
    pub fn new(key: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            fields: Metadata::new(),
        }
    }

    /// Add a structured field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Outbound payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Raw content
    pub content: Bytes,
    /// Headers (used by naming templates and bindings)
    pub headers: Metadata,
}

impl Payload {
    /// Create a payload without headers
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            headers: Metadata::new(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    /// Buffer reached `batchSize`
    Size,
    /// `batchTimeoutMs` elapsed since the last flush
    Time,
    /// Explicit `flush()`
    Manual,
    /// Final flush during `destroy()`
    Shutdown,
}

impl FlushTrigger {
    /// Label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Time => "time",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// What became of one polled item, reported back to the binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    /// Handed off and recorded in the duplicate filter
    Processed,
    /// Rejected by the duplicate filter
    Duplicate,
    /// Handler (or fingerprinting) failed
    Failed,
}

impl ItemOutcome {
    /// Label used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Processed => "processed",
            ItemOutcome::Duplicate => "duplicate",
            ItemOutcome::Failed => "failed",
        }
    }
}

/// One indivisible unit handed to an outbound binding
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Batch sequence number (None for single sends)
    pub sequence: Option<u64>,
    /// Flush trigger (None for single sends)
    pub trigger: Option<FlushTrigger>,
    /// Payloads in insertion order
    pub items: Vec<Payload>,
}

impl Delivery {
    /// A single, unbatched payload
    pub fn single(payload: Payload) -> Self {
        Self {
            sequence: None,
            trigger: None,
            items: vec![payload],
        }
    }

    /// Whether this unit came from the batch accumulator
    pub fn is_batch(&self) -> bool {
        self.sequence.is_some()
    }

    /// Total content bytes
    pub fn content_len(&self) -> usize {
        self.items.iter().map(|p| p.content.len()).sum()
    }
}

/// Receipt returned by an outbound binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// External reference (path, message id, generated key)
    pub reference: String,
    /// Bytes written
    pub bytes_written: u64,
    /// Items contained
    pub item_count: usize,
    /// Binding-specific details
    pub metadata: Metadata,
}

/// Outcome of one connection sub-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Check name (e.g. "Directory Access")
    pub name: String,
    /// Passed
    pub passed: bool,
    /// Detail message
    pub message: String,
}

impl ProbeResult {
    /// Passed check
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
        }
    }

    /// Failed check
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
        }
    }
}

/// Combined report of every connection sub-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReport {
    /// Every sub-check, in execution order
    pub checks: Vec<ProbeResult>,
}

impl ConnectionReport {
    /// True when every check passed
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Failed checks
    pub fn failures(&self) -> impl Iterator<Item = &ProbeResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let passed = self.checks.iter().filter(|c| c.passed).count();
        let mut summary = format!("{}/{} checks passed", passed, self.checks.len());
        for failed in self.failures() {
            summary.push_str(&format!("; {}: {}", failed.name, failed.message));
        }
        summary
    }
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Healthy
    Healthy,
    /// Degraded (last operation failed but adapter still operational)
    Degraded,
    /// Unhealthy (circuit breaker open, destroyed or never initialized)
    Unhealthy,
}

/// Adapter health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    /// Adapter ID
    pub adapter_id: String,
    /// Adapter type
    pub adapter_type: AdapterType,
    /// Direction
    pub mode: AdapterMode,
    /// Lifecycle state
    pub state: AdapterState,
    /// Status
    pub status: HealthStatus,
    /// Last activity
    pub last_activity: DateTime<Utc>,
    /// Total operations
    pub total_operations: u64,
    /// Successful operations
    pub successful_operations: u64,
    /// Failed operations
    pub failed_operations: u64,
    /// Circuit breaker state
    pub circuit_breaker_open: bool,
    /// Items waiting in the batch buffer
    pub buffered_items: usize,
    /// Sessions currently open
    pub open_sessions: usize,
}

impl AdapterHealth {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 1.0;
        }
        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Calculate failure rate
    pub fn failure_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_summary_lists_every_failure() {
        let report = ConnectionReport {
            checks: vec![
                ProbeResult::pass("Reachability", "connected"),
                ProbeResult::fail("Directory Access", "missing"),
                ProbeResult::fail("Support Directories", "backup dir not writable"),
            ],
        };
        assert!(!report.all_passed());
        let summary = report.summary();
        assert!(summary.starts_with("1/3 checks passed"));
        assert!(summary.contains("Directory Access: missing"));
        assert!(summary.contains("Support Directories"));
    }

    #[test]
    fn test_delivery_single() {
        let delivery = Delivery::single(Payload::new("abc"));
        assert!(!delivery.is_batch());
        assert_eq!(delivery.content_len(), 3);
    }
}
