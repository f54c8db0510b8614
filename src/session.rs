//! Server-side session
//!
//! Wraps one accepted transport. Same read/write/error behavior as a client
//! connection; its events are also routed to the owning listener, which
//! unregisters the session once it disconnects.

use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::event::ConnectionEvent;
use crate::link::{LinkCore, LinkObserver, LinkStats};
use crate::transport::{Endpoint, Transport};
use crate::SessionId;

/// Listener-side hooks a session reports to.
pub(crate) trait SessionOwner: Send + Sync + 'static {
    fn session_event(&self, session: SessionId, event: &ConnectionEvent);
}

/// Forwards link events to the owner without keeping it alive.
struct SessionHook {
    session: SessionId,
    owner: Weak<dyn SessionOwner>,
}

impl LinkObserver for SessionHook {
    fn on_event(&self, event: &ConnectionEvent) {
        if let Some(owner) = self.owner.upgrade() {
            owner.session_event(self.session, event);
        }
    }
}

/// Accepted connection tracked by a listener
pub struct Session<T: Transport> {
    id: SessionId,
    owner_id: u64,
    nodelay: bool,
    core: Arc<LinkCore<T::Writer>>,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        id: SessionId,
        owner_id: u64,
        owner: Weak<dyn SessionOwner>,
        buffer_size: usize,
        timeout: Option<Duration>,
        nodelay: bool,
        event_capacity: usize,
    ) -> Self {
        let hook: Arc<dyn LinkObserver> = Arc::new(SessionHook { session: id, owner });
        let core = LinkCore::new(id.to_string(), buffer_size, timeout, event_capacity, None, Some(hook));
        Self {
            id,
            owner_id,
            nodelay,
            core,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn owner_id(&self) -> u64 {
        self.owner_id
    }

    /// Adopt an already-accepted transport and start receiving.
    ///
    /// Applies the listener's no-delay policy. Returns `false` if already
    /// connected or disposed; the stream is closed in that case.
    pub fn connect(&self, stream: T) -> bool {
        if self.core.is_disposed() || self.core.is_connected() {
            return false;
        }
        if let Err(error) = stream.set_nodelay(self.nodelay) {
            tracing::warn!("{} failed to apply nodelay: {}", self.id, error);
        }
        self.core.attach(stream)
    }

    /// Disconnect; the owning listener then drops the session from its registry.
    pub fn disconnect(&self) -> bool {
        self.core.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.core.local_endpoint()
    }

    /// Peer endpoint, populated on connect and kept after disconnect.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.core.remote_endpoint()
    }

    pub fn stats(&self) -> LinkStats {
        self.core.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.subscribe()
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.core.send(data).await
    }

    pub fn send_async(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.core.send_async(data.into())
    }

    /// Disconnect and release the transport. Idempotent.
    pub fn dispose(&self) {
        if self.core.dispose() {
            tracing::debug!("{} disposed", self.id);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote_endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// TCP server session
#[cfg(feature = "tcp")]
pub type TcpSession = Session<tokio::net::TcpStream>;

/// Pipe server session
#[cfg(feature = "pipe")]
pub type PipeSession = Session<crate::transport::pipe::PipeStream>;
