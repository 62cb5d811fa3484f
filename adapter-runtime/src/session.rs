//! Connection mode manager
//!
//! Owns every session of an adapter instance. In permanent mode one session
//! is held for the adapter's lifetime and checked for liveness on every
//! acquire; in per-operation mode each lease carries its own session, which
//! is disconnected on release or when the lease is dropped.

use crate::{
    config::{AdapterConfig, ConnectionMode},
    connector::ProtocolBinding,
    metrics::SESSIONS_OPEN,
    retry::{retry_transient, with_timeout, RetryPolicy},
    Error, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

enum LeaseInner<S> {
    Held(OwnedMutexGuard<Option<S>>),
    Owned(Option<S>),
}

/// Exclusive access to a live session for one operation
///
/// Hand it back through [`SessionManager::release`] or
/// [`SessionManager::discard`]. A per-operation lease dropped without either
/// (a cancelled operation) disconnects its session on a spawned task.
pub struct SessionLease<B: ProtocolBinding> {
    inner: LeaseInner<B::Session>,
    binding: Arc<B>,
    adapter_id: String,
    open_sessions: Arc<AtomicUsize>,
}

impl<B: ProtocolBinding> SessionLease<B> {
    /// The leased session
    pub fn session(&mut self) -> Result<&mut B::Session> {
        let session = match &mut self.inner {
            LeaseInner::Held(guard) => guard.as_mut(),
            LeaseInner::Owned(session) => session.as_mut(),
        };
        session.ok_or_else(|| Error::Connection("session already released".into()))
    }
}

impl<B: ProtocolBinding> Drop for SessionLease<B> {
    fn drop(&mut self) {
        let session = match &mut self.inner {
            LeaseInner::Owned(session) => session.take(),
            LeaseInner::Held(_) => None,
        };
        let Some(session) = session else {
            return;
        };

        warn!(
            "Adapter {} per-operation session dropped without release",
            self.adapter_id
        );
        let binding = self.binding.clone();
        let adapter_id = self.adapter_id.clone();
        let open_sessions = self.open_sessions.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    disconnect(binding.as_ref(), &adapter_id, &open_sessions, session).await;
                });
            }
            Err(_) => {
                error!(
                    "Adapter {} leaked a session: no runtime to disconnect it on",
                    adapter_id
                );
                closed(&adapter_id, &open_sessions);
            }
        }
    }
}

async fn disconnect<B: ProtocolBinding>(
    binding: &B,
    adapter_id: &str,
    open_sessions: &AtomicUsize,
    session: B::Session,
) {
    if let Err(e) = binding.disconnect(session).await {
        warn!("Adapter {} failed to disconnect cleanly: {}", adapter_id, e);
    }
    closed(adapter_id, open_sessions);
}

fn closed(adapter_id: &str, open_sessions: &AtomicUsize) {
    open_sessions.fetch_sub(1, Ordering::SeqCst);
    SESSIONS_OPEN.with_label_values(&[adapter_id]).dec();
    debug!("Adapter {} closed a session", adapter_id);
}

/// Connection mode manager
pub struct SessionManager<B: ProtocolBinding> {
    adapter_id: String,
    binding: Arc<B>,
    mode: ConnectionMode,
    retry: RetryPolicy,
    connect_timeout: Duration,
    held: Arc<Mutex<Option<B::Session>>>,
    open_sessions: Arc<AtomicUsize>,
}

impl<B: ProtocolBinding> SessionManager<B> {
    /// Create new manager
    pub fn new(adapter_id: impl Into<String>, binding: Arc<B>, config: &AdapterConfig) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            binding,
            mode: config.connection_mode,
            retry: RetryPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            held: Arc::new(Mutex::new(None)),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connection mode
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Sessions currently open
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Open the permanent session (no-op in per-operation mode)
    pub async fn start(&self) -> Result<()> {
        if self.mode != ConnectionMode::Permanent {
            return Ok(());
        }
        let mut held = self.held.lock().await;
        if held.is_none() {
            *held = Some(self.connect().await?);
            info!("Adapter {} holds a permanent session", self.adapter_id);
        }
        Ok(())
    }

    /// Acquire a live session
    pub async fn acquire(&self) -> Result<SessionLease<B>> {
        let inner = match self.mode {
            ConnectionMode::Permanent => {
                let mut guard = self.held.clone().lock_owned().await;
                let alive = match guard.as_ref() {
                    Some(session) => self.binding.is_alive(session).await,
                    None => false,
                };
                if !alive {
                    if let Some(dead) = guard.take() {
                        warn!("Adapter {} session is dead, reconnecting", self.adapter_id);
                        self.disconnect(dead).await;
                    }
                    *guard = Some(self.connect().await?);
                }
                LeaseInner::Held(guard)
            }
            ConnectionMode::PerOperation => LeaseInner::Owned(Some(self.connect().await?)),
        };

        Ok(SessionLease {
            inner,
            binding: self.binding.clone(),
            adapter_id: self.adapter_id.clone(),
            open_sessions: self.open_sessions.clone(),
        })
    }

    /// Return a lease; per-operation sessions are disconnected
    ///
    /// Safe on a lease whose session is already gone.
    pub async fn release(&self, mut lease: SessionLease<B>) {
        if let LeaseInner::Owned(session) = &mut lease.inner {
            if let Some(session) = session.take() {
                self.disconnect(session).await;
            }
        }
    }

    /// Return a lease after a transient failure
    ///
    /// A held permanent session is closed as well, so the next acquire
    /// starts from a fresh connection.
    pub async fn discard(&self, mut lease: SessionLease<B>) {
        let session = match &mut lease.inner {
            LeaseInner::Held(guard) => guard.take(),
            LeaseInner::Owned(session) => session.take(),
        };
        if let Some(session) = session {
            self.disconnect(session).await;
        }
    }

    /// Close the permanent session, if any
    pub async fn close(&self) {
        let session = self.held.lock().await.take();
        if let Some(session) = session {
            self.disconnect(session).await;
        }
    }

    async fn connect(&self) -> Result<B::Session> {
        let session = retry_transient(&self.retry, "connect", || {
            with_timeout(self.connect_timeout, "connect", self.binding.connect())
        })
        .await?;

        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        SESSIONS_OPEN.with_label_values(&[self.adapter_id.as_str()]).inc();
        debug!("Adapter {} opened a session", self.adapter_id);
        Ok(session)
    }

    async fn disconnect(&self, session: B::Session) {
        disconnect(self.binding.as_ref(), &self.adapter_id, &self.open_sessions, session).await;
    }
}
