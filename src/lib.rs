//! linkwire - connection lifecycle management for byte-stream transports
//!
//! Client connections, server-accepted sessions and listeners with a live
//! session registry, written once over a transport trait and provided for TCP
//! and local pipes. All I/O runs on tokio; state changes, traffic and errors
//! are delivered as broadcast events.

pub mod config;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod transport;

mod link;

pub mod connection;
pub mod listener;
pub mod session;

/// Identifier of a session within its listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<SessionId> for u64 {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

// Core types
pub use config::{ConfigError, ConnectionConfig, ListenerConfig};
pub use connection::Connection;
pub use error::{is_expected_teardown, TransportError};
pub use event::{ConnectionEvent, ListenerEvent};
pub use heartbeat::Heartbeat;
pub use link::LinkStats;
pub use listener::Listener;
pub use session::Session;
pub use transport::{Acceptor, Binder, Connector, Endpoint, Transport, TransportWriter};

#[cfg(feature = "tcp")]
pub use connection::TcpConnection;
#[cfg(feature = "tcp")]
pub use listener::TcpListener;
#[cfg(feature = "tcp")]
pub use session::TcpSession;

#[cfg(feature = "pipe")]
pub use connection::PipeConnection;
#[cfg(feature = "pipe")]
pub use listener::PipeListener;
#[cfg(feature = "pipe")]
pub use session::PipeSession;

// Transport-specific aliases
pub type Result<T> = std::result::Result<T, TransportError>;
