//! # Adapter Runtime
//!
//! Execution framework for protocol adapters of the integration platform:
//! - Lifecycle state machine (initialize, test, execute, destroy)
//! - Permanent / per-operation connection modes
//! - Incremental cursor for delta polling
//! - Bounded duplicate filter with keyed fingerprints
//! - Size / time / mixed outbound batching
//! - Atomic materialization with backups and verification
//! - Uniform result envelope
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Adapter Manager (registry, health)           │
//! └────────────┬────────────────────────────────────────┘
//!              │
//! ┌────────────▼────────────────────────────────────────┐
//! │   AdapterRuntime<B>  (lifecycle, circuit breaker)   │
//! │  ┌──────────┐ ┌────────┐ ┌─────────┐ ┌───────────┐  │
//! │  │ Sessions │ │ Cursor │ │ Dedup   │ │ Batching  │  │
//! │  └────┬─────┘ └────────┘ └─────────┘ └─────┬─────┘  │
//! └───────┼────────────────────────────────────┼────────┘
//!         │                                    │
//! ┌───────▼────────────────────────────────────▼────────┐
//! │  ProtocolBinding (File, FTP, JDBC, ...)             │
//! │       └── AtomicMaterializer over ArtifactStore     │
//! └─────────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod batch;
pub mod bindings;
pub mod circuit_breaker;
pub mod config;
pub mod connector;
pub mod cursor;
pub mod dedup;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod materializer;
pub mod metrics;
pub mod naming;
pub mod result;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod types;

pub use config::AdapterConfig;
pub use connector::{Forward, ItemHandler, ProtocolBinding};
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::AdapterState;
pub use manager::{AdapterManager, ManagedAdapter};
pub use result::{Metadata, OperationResult, OutcomeKind};
pub use runtime::{AdapterRuntime, SendOutcome};
pub use types::*;

/// Default connect attempts for transient failures
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default circuit breaker threshold (failures before opening)
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;

/// Default circuit breaker timeout (seconds before half-open)
pub const DEFAULT_CB_TIMEOUT_SECONDS: u64 = 60;

/// Default network operation timeout (milliseconds)
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;

/// Default number of fingerprint records kept per adapter
pub const DEFAULT_DUPLICATE_CAPACITY: usize = 100_000;
