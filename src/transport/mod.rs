//! Byte-stream transport abstraction
//!
//! Connections, sessions and listeners are written once against these traits.
//! `tcp` and `pipe` provide the concrete transports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ListenerConfig;

#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "pipe")]
pub mod pipe;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "tcp")]
pub use tcp::{TcpAcceptor, TcpBinder, TcpConnector};
#[cfg(feature = "pipe")]
pub use pipe::{PipeAcceptor, PipeBinder, PipeConnector};

/// Address of one end of a transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// TCP socket address
    Tcp(std::net::SocketAddr),
    /// Pipe address: `server/name` for a dialed pipe, the bare name otherwise
    Pipe(String),
}

impl Endpoint {
    pub fn as_socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Endpoint::Tcp(addr) => Some(*addr),
            Endpoint::Pipe(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.as_socket_addr().map(|addr| addr.port())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Pipe(name) => write!(f, "pipe://{}", name),
        }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Endpoint::Tcp(addr)
    }
}

/// Write half of an established transport.
pub trait TransportWriter: AsyncWrite + Send + Unpin + 'static {
    /// Non-blocking liveness check.
    ///
    /// Returns the pending socket error, if any. Transports without such a
    /// notion report `Ok(())`.
    fn probe(&self) -> io::Result<()>;
}

/// An established bidirectional byte stream.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Send + Unpin + 'static;
    type Writer: TransportWriter;

    fn local_endpoint(&self) -> Option<Endpoint>;

    fn peer_endpoint(&self) -> Option<Endpoint>;

    /// Apply the no-delay policy. Transports without Nagle ignore it.
    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }

    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Client-side dialer producing one transport per call.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: Transport;

    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Remote endpoint, fixed at construction.
    fn remote_endpoint(&self) -> Endpoint;

    /// Whether connect/send honor the connection timeout.
    fn supports_timeout(&self) -> bool {
        false
    }
}

/// Bound server-side transport that hands out accepted streams.
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Stream: Transport;

    async fn accept(&mut self) -> io::Result<Self::Stream>;

    /// Actual bound endpoint (resolves an OS-assigned port).
    fn local_endpoint(&self) -> io::Result<Endpoint>;
}

/// Creates and binds the listening transport.
#[async_trait]
pub trait Binder: Send + Sync + 'static {
    type Acceptor: Acceptor;

    async fn bind(&self, config: &ListenerConfig) -> io::Result<Self::Acceptor>;

    /// Configured endpoint before binding.
    fn endpoint(&self) -> Endpoint;

    /// Most sessions a listener may hold at once; `None` means unbounded.
    fn session_limit(&self, _config: &ListenerConfig) -> Option<usize> {
        None
    }
}

/// Stream type produced by a binder's acceptor.
pub type AcceptedStream<B> = <<B as Binder>::Acceptor as Acceptor>::Stream;
