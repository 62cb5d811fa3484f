//! Adapter configuration
//!
//! Option names are uniform across bindings and use camelCase keys, e.g.
//!
//! ```toml
//! name = "orders-inbox"
//! connectionMode = "per-operation"
//! pollingIntervalMs = 5000
//! batchStrategy = "mixed"
//! batchSize = 100
//! batchTimeoutMs = 2000
//! duplicateStrategy = "key+fingerprint"
//! atomicWrite = true
//! backupEnabled = true
//! maxBackupFiles = 3
//! ```

use crate::{circuit_breaker::CircuitBreakerConfig, dedup::ChecksumAlgorithm, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Connection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// One session held for the adapter's lifetime
    Permanent,
    /// Session opened and closed around every operation
    PerOperation,
}

/// Batch flush strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    /// No batching, every payload is delivered on its own
    None,
    /// Flush when the buffer holds `batchSize` items
    Size,
    /// Flush when `batchTimeoutMs` elapsed since the last flush
    Time,
    /// Either condition
    Mixed,
}

impl BatchStrategy {
    /// Whether the size condition applies
    pub fn uses_size(self) -> bool {
        matches!(self, BatchStrategy::Size | BatchStrategy::Mixed)
    }

    /// Whether the time condition applies
    pub fn uses_time(self) -> bool {
        matches!(self, BatchStrategy::Time | BatchStrategy::Mixed)
    }
}

/// Duplicate detection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateStrategy {
    /// Accept everything
    #[serde(rename = "none")]
    None,
    /// Reject a key seen before, regardless of content
    #[serde(rename = "key")]
    Key,
    /// Reject content seen before under any key
    #[serde(rename = "fingerprint")]
    Fingerprint,
    /// Reject only unmodified re-delivery of the same key
    #[serde(rename = "key+fingerprint")]
    KeyAndFingerprint,
}

/// What happens to a batch snapshot when its flush fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushFailurePolicy {
    /// Items are dropped and reported in the failure result
    Drop,
    /// Items are put back at the front of the buffer
    Requeue,
}

/// Write mode for materialized artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Fail when the artifact already exists
    Create,
    /// Replace the artifact
    Overwrite,
    /// Append to the artifact
    Append,
}

/// Adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterConfig {
    /// Display name
    pub name: String,

    /// Connection mode
    pub connection_mode: ConnectionMode,

    /// Interval used by the external scheduler (ms)
    pub polling_interval_ms: u64,

    /// Session establishment timeout (ms)
    pub connect_timeout_ms: u64,

    /// Per network operation timeout (ms)
    pub operation_timeout_ms: u64,

    /// Attempts for transient connect failures
    pub max_retry_attempts: u32,

    /// Initial retry delay (ms)
    pub initial_retry_delay_ms: u64,

    /// Max retry delay (ms)
    pub max_retry_delay_ms: u64,

    /// Batch strategy
    pub batch_strategy: BatchStrategy,

    /// Batch size (size/mixed)
    pub batch_size: Option<usize>,

    /// Batch timeout (time/mixed, ms)
    pub batch_timeout_ms: Option<u64>,

    /// Flush failure policy
    pub flush_failure_policy: FlushFailurePolicy,

    /// Skip failed items instead of aborting the batch/poll
    pub continue_on_error: bool,

    /// Field driving incremental polling
    pub cursor_column: Option<String>,

    /// Duplicate strategy
    pub duplicate_strategy: DuplicateStrategy,

    /// Digest used for fingerprints and checksums
    pub checksum_algorithm: String,

    /// Secret that keys the fingerprint digest
    pub fingerprint_key: Option<String>,

    /// Max fingerprint records kept (0 = unbounded)
    pub duplicate_capacity: usize,

    /// Rolling duplicate window (ms); None = adapter lifetime
    pub duplicate_window_ms: Option<u64>,

    /// Write mode
    pub write_mode: WriteMode,

    /// Write to a temporary artifact and rename into place
    pub atomic_write: bool,

    /// Suffix of the temporary artifact
    pub temporary_suffix: String,

    /// Directory for temporary artifacts (default: next to the target)
    pub temporary_directory: Option<PathBuf>,

    /// Back up an existing artifact before overwriting
    pub backup_enabled: bool,

    /// Backup directory (default: next to the target)
    pub backup_directory: Option<PathBuf>,

    /// Backup suffix
    pub backup_suffix: String,

    /// Backups kept per artifact
    pub max_backup_files: usize,

    /// Re-read size after writing
    pub validate_write: bool,

    /// Also compare a checksum after writing
    pub verify_checksum: bool,

    /// Write a `<name><.algo>` checksum sidecar
    pub checksum_file: bool,

    /// Circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: "adapter".to_string(),
            connection_mode: ConnectionMode::PerOperation,
            polling_interval_ms: 60_000,
            connect_timeout_ms: 10_000,
            operation_timeout_ms: crate::DEFAULT_OPERATION_TIMEOUT_MS,
            max_retry_attempts: crate::DEFAULT_RETRY_ATTEMPTS,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 2_000,
            batch_strategy: BatchStrategy::None,
            batch_size: None,
            batch_timeout_ms: None,
            flush_failure_policy: FlushFailurePolicy::Drop,
            continue_on_error: false,
            cursor_column: None,
            duplicate_strategy: DuplicateStrategy::None,
            checksum_algorithm: "SHA-256".to_string(),
            fingerprint_key: None,
            duplicate_capacity: crate::DEFAULT_DUPLICATE_CAPACITY,
            duplicate_window_ms: None,
            write_mode: WriteMode::Overwrite,
            atomic_write: true,
            temporary_suffix: ".tmp".to_string(),
            temporary_directory: None,
            backup_enabled: false,
            backup_directory: None,
            backup_suffix: ".bak".to_string(),
            max_backup_files: 5,
            validate_write: false,
            verify_checksum: false,
            checksum_file: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl AdapterConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `ADAPTER_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(mode) = std::env::var("ADAPTER_CONNECTION_MODE") {
            self.connection_mode = match mode.as_str() {
                "permanent" => ConnectionMode::Permanent,
                "per-operation" => ConnectionMode::PerOperation,
                other => {
                    return Err(Error::config(
                        "connectionMode",
                        format!("unknown mode '{}'", other),
                    ))
                }
            };
        }

        if let Ok(value) = std::env::var("ADAPTER_POLLING_INTERVAL_MS") {
            self.polling_interval_ms = parse_env("pollingIntervalMs", &value)?;
        }

        if let Ok(value) = std::env::var("ADAPTER_BATCH_SIZE") {
            self.batch_size = Some(parse_env("batchSize", &value)?);
        }

        if let Ok(value) = std::env::var("ADAPTER_BATCH_TIMEOUT_MS") {
            self.batch_timeout_ms = Some(parse_env("batchTimeoutMs", &value)?);
        }

        if let Ok(value) = std::env::var("ADAPTER_OPERATION_TIMEOUT_MS") {
            self.operation_timeout_ms = parse_env("operationTimeoutMs", &value)?;
        }

        Ok(self)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Validate; the error names the offending option
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("name", "must not be empty"));
        }

        if self.polling_interval_ms == 0 {
            return Err(Error::config("pollingIntervalMs", "must be greater than 0"));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::config("connectTimeoutMs", "must be greater than 0"));
        }

        if self.operation_timeout_ms == 0 {
            return Err(Error::config("operationTimeoutMs", "must be greater than 0"));
        }

        if self.max_retry_attempts == 0 {
            return Err(Error::config("maxRetryAttempts", "must be at least 1"));
        }

        if self.batch_strategy.uses_size() && !matches!(self.batch_size, Some(n) if n > 0) {
            return Err(Error::config(
                "batchSize",
                "a positive value is required for size and mixed batching",
            ));
        }

        if self.batch_strategy.uses_time() && !matches!(self.batch_timeout_ms, Some(ms) if ms > 0)
        {
            return Err(Error::config(
                "batchTimeoutMs",
                "a positive value is required for time and mixed batching",
            ));
        }

        if matches!(self.cursor_column.as_deref(), Some(c) if c.trim().is_empty()) {
            return Err(Error::config("cursorColumn", "must not be blank"));
        }

        self.checksum_algorithm()?;

        if matches!(self.fingerprint_key.as_deref(), Some("")) {
            return Err(Error::config("fingerprintKey", "must not be empty when set"));
        }

        if self.atomic_write && self.temporary_suffix.is_empty() {
            return Err(Error::config(
                "temporarySuffix",
                "required when atomicWrite is enabled",
            ));
        }

        if self.backup_enabled && self.max_backup_files == 0 {
            return Err(Error::config(
                "maxBackupFiles",
                "must be at least 1 when backups are enabled",
            ));
        }

        if self.backup_enabled && self.backup_suffix.is_empty() {
            return Err(Error::config("backupSuffix", "must not be empty"));
        }

        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::config(
                "circuitBreaker.failureThreshold",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Parsed checksum algorithm
    pub fn checksum_algorithm(&self) -> Result<ChecksumAlgorithm> {
        self.checksum_algorithm.parse().map_err(|_| {
            Error::config(
                "checksumAlgorithm",
                format!("unsupported algorithm '{}'", self.checksum_algorithm),
            )
        })
    }

    /// Whether outbound payloads go through the batch accumulator
    pub fn batching_enabled(&self) -> bool {
        self.batch_strategy != BatchStrategy::None
    }

    /// Polling interval
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Operation timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(field, format!("invalid value '{}'", value)))
}
