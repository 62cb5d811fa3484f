//! Circuit breaker per adapter instance
//!
//! Only transient failures (connection errors, timeouts) count towards the
//! threshold; validation failures say nothing about endpoint health.

use crate::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Closed (normal operation)
    Closed,
    /// Open (rejecting requests)
    Open,
    /// Half-open (testing)
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Gate operations through the breaker
    pub enabled: bool,
    /// Failure threshold (open after N consecutive transient failures)
    pub failure_threshold: u32,
    /// Timeout (seconds before half-open)
    pub timeout_seconds: u64,
    /// Success threshold (close after N successes in half-open)
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: crate::DEFAULT_CB_FAILURE_THRESHOLD,
            timeout_seconds: crate::DEFAULT_CB_TIMEOUT_SECONDS,
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    adapter_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new(adapter_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Check if request is allowed
    pub fn is_request_allowed(&self) -> Result<()> {
        self.is_request_allowed_at(Utc::now())
    }

    fn is_request_allowed_at(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| now.signed_duration_since(at).num_seconds().max(0) as u64)
                    .unwrap_or(u64::MAX);

                if elapsed >= self.config.timeout_seconds {
                    info!("Circuit breaker half-opening for adapter {}", self.adapter_id);
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    Ok(())
                } else {
                    Err(Error::CircuitBreakerOpen {
                        adapter: self.adapter_id.clone(),
                        reason: format!(
                            "Circuit open, retry in {}s",
                            self.config.timeout_seconds - elapsed
                        ),
                    })
                }
            }
        }
    }

    /// Record success
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!("Circuit breaker closing for adapter {}", self.adapter_id);
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation; only transient kinds count
    pub fn record_failure(&self, kind: ErrorKind) {
        if !matches!(kind, ErrorKind::Connection | ErrorKind::Timeout) {
            return;
        }
        self.record_failure_at(Utc::now());
    }

    fn record_failure_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opening for adapter {} after {} failures",
                        self.adapter_id, inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker re-opening for adapter {}", self.adapter_id);
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the breaker is enabled and currently rejecting requests
    pub fn is_open(&self) -> bool {
        self.config.enabled && self.state() == CircuitState::Open
    }

    /// Reset circuit breaker (manual intervention)
    pub fn reset(&self) {
        info!("Manually resetting circuit breaker for adapter {}", self.adapter_id);
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_at = None;
    }
}
