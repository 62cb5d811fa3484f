//! Adapter lifecycle state machine
//!
//! ```text
//! Uninitialized ──► Initializing ──► Ready ──► Active ◄──► Faulted
//!       ▲                │             │          │           │
//!       └── (init fail) ─┘             └──────────┴───────────┴──► Destroyed
//! ```

use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Lifecycle state of an adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    /// Constructed, not yet initialized
    Uninitialized,
    /// `initialize()` in progress
    Initializing,
    /// Initialized, no operation executed yet
    Ready,
    /// At least one operation completed successfully
    Active,
    /// Last operation failed; a later call may retry
    Faulted,
    /// Terminal
    Destroyed,
}

impl AdapterState {
    /// Whether `execute`-style operations are permitted
    pub fn can_execute(self) -> bool {
        matches!(
            self,
            AdapterState::Ready | AdapterState::Active | AdapterState::Faulted
        )
    }

    /// Whether `test_connection` is permitted
    pub fn can_test(self) -> bool {
        matches!(self, AdapterState::Ready | AdapterState::Active)
    }

    /// Whether the transition `self -> next` is allowed
    pub fn can_transition_to(self, next: AdapterState) -> bool {
        use AdapterState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Uninitialized, Initializing) => true,
            (Initializing, Ready) | (Initializing, Uninitialized) => true,
            (Ready, Active) | (Ready, Faulted) => true,
            (Active, Faulted) | (Faulted, Active) => true,
            (Active, Active) | (Faulted, Faulted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterState::Uninitialized => write!(f, "UNINITIALIZED"),
            AdapterState::Initializing => write!(f, "INITIALIZING"),
            AdapterState::Ready => write!(f, "READY"),
            AdapterState::Active => write!(f, "ACTIVE"),
            AdapterState::Faulted => write!(f, "FAULTED"),
            AdapterState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// Guarded lifecycle for one adapter instance
#[derive(Debug)]
pub struct Lifecycle {
    adapter_id: String,
    state: RwLock<AdapterState>,
}

impl Lifecycle {
    /// Create a lifecycle in `Uninitialized`
    pub fn new(adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            state: RwLock::new(AdapterState::Uninitialized),
        }
    }

    /// Current state
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Transition to `next`, rejecting illegal moves
    pub fn transition(&self, next: AdapterState) -> Result<AdapterState> {
        let mut state = self.state.write();
        let previous = *state;
        if !previous.can_transition_to(next) {
            return Err(Error::InvalidState {
                operation: format!("transition to {}", next),
                state: previous,
            });
        }
        *state = next;
        if previous != next {
            if matches!(next, AdapterState::Faulted | AdapterState::Active) {
                debug!("Adapter {} {} -> {}", self.adapter_id, previous, next);
            } else {
                info!("Adapter {} {} -> {}", self.adapter_id, previous, next);
            }
        }
        Ok(previous)
    }

    /// Ensure an operation is allowed in the current state
    pub fn ensure(&self, operation: &str, allowed: fn(AdapterState) -> bool) -> Result<()> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation: operation.to_string(),
                state,
            })
        }
    }

    /// Record the outcome of an execute-style operation
    pub fn record_outcome(&self, success: bool) {
        let next = if success {
            AdapterState::Active
        } else {
            AdapterState::Faulted
        };
        // A concurrent destroy wins; nothing to record afterwards.
        let _ = self.transition(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let lifecycle = Lifecycle::new("FILE-test");
        assert_eq!(lifecycle.state(), AdapterState::Uninitialized);
        lifecycle.transition(AdapterState::Initializing).unwrap();
        lifecycle.transition(AdapterState::Ready).unwrap();
        lifecycle.record_outcome(false);
        assert_eq!(lifecycle.state(), AdapterState::Faulted);
        lifecycle.record_outcome(true);
        assert_eq!(lifecycle.state(), AdapterState::Active);
        lifecycle.transition(AdapterState::Destroyed).unwrap();
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let lifecycle = Lifecycle::new("FILE-test");
        lifecycle.transition(AdapterState::Destroyed).unwrap();
        assert!(lifecycle.transition(AdapterState::Initializing).is_err());
        lifecycle.record_outcome(true);
        assert_eq!(lifecycle.state(), AdapterState::Destroyed);
    }

    #[test]
    fn test_execute_requires_initialization() {
        let lifecycle = Lifecycle::new("FILE-test");
        assert!(lifecycle.ensure("poll", AdapterState::can_execute).is_err());
        assert!(!AdapterState::Faulted.can_test());
        assert!(AdapterState::Faulted.can_execute());
    }
}
