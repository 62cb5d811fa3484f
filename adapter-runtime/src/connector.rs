//! Protocol binding interface
//!
//! A binding supplies only the protocol calls; batching, cursors, duplicate
//! suppression, session handling and result translation live in
//! [`AdapterRuntime`](crate::runtime::AdapterRuntime).

use crate::{cursor::IncrementalCursor, types::*, Error, Result};
use async_trait::async_trait;

/// Capability interface every protocol binding implements
///
/// All methods must translate client-library failures into [`Error`]
/// variants before returning.
#[async_trait]
pub trait ProtocolBinding: Send + Sync + 'static {
    /// Live connection/channel handle
    type Session: Send + Sync + 'static;

    /// Get adapter type
    fn adapter_type(&self) -> AdapterType;

    /// Direction this binding serves
    fn mode(&self) -> AdapterMode;

    /// Binding-specific configuration checks, run by `initialize()`
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Open a session
    async fn connect(&self) -> Result<Self::Session>;

    /// Close a session
    async fn disconnect(&self, session: Self::Session) -> Result<()>;

    /// Cheap liveness check for a held session
    async fn is_alive(&self, session: &Self::Session) -> bool;

    /// Narrow read-only checks used by `test_connection()`
    ///
    /// Every check runs; none short-circuits the others.
    async fn probe(&self, session: &mut Self::Session) -> Vec<ProbeResult>;

    /// Fetch items newer than the cursor (sender bindings)
    async fn fetch(
        &self,
        _session: &mut Self::Session,
        _cursor: &IncrementalCursor,
    ) -> Result<Vec<RawItem>> {
        Err(Error::Unsupported(format!(
            "{} binding does not fetch",
            self.adapter_type()
        )))
    }

    /// Settle a polled item at the source once its outcome is known
    ///
    /// Called for every fetched item that reached the duplicate filter, on
    /// the session it was fetched with. Sources that need no post-processing
    /// keep the default.
    async fn acknowledge(
        &self,
        _session: &mut Self::Session,
        _item: &RawItem,
        _outcome: ItemOutcome,
    ) -> Result<()> {
        Ok(())
    }

    /// Deliver one unit (receiver bindings)
    async fn deliver(
        &self,
        _session: &mut Self::Session,
        _delivery: &Delivery,
    ) -> Result<DeliveryReceipt> {
        Err(Error::Unsupported(format!(
            "{} binding does not deliver",
            self.adapter_type()
        )))
    }

    /// Free-text configuration summary for operators
    fn describe(&self) -> String;
}

/// Downstream consumer of polled items
#[async_trait]
pub trait ItemHandler: Send + Sync {
    /// Process one item; an `Err` leaves it eligible for the next poll
    async fn handle(&self, item: &RawItem) -> Result<()>;
}

/// Handler that accepts every item; polled items are returned in the result
#[derive(Debug, Default, Clone, Copy)]
pub struct Forward;

#[async_trait]
impl ItemHandler for Forward {
    async fn handle(&self, _item: &RawItem) -> Result<()> {
        Ok(())
    }
}
