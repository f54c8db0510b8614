//! TCP transport
//!
//! Listening sockets are built with socket2 so the listener config (dual-mode,
//! backlog, buffer sizes) can be applied before tokio takes over the socket.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use super::{Acceptor, Binder, Connector, Endpoint, Transport, TransportWriter};
use crate::config::ListenerConfig;

impl TransportWriter for OwnedWriteHalf {
    fn probe(&self) -> io::Result<()> {
        match self.as_ref().take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Transport for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_addr().ok().map(Endpoint::Tcp)
    }

    fn peer_endpoint(&self) -> Option<Endpoint> {
        self.peer_addr().ok().map(Endpoint::Tcp)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        TcpStream::into_split(self)
    }
}

/// Dials a fixed remote address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    remote: SocketAddr,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(remote: SocketAddr) -> Self {
        Self { remote, nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        tracing::debug!("🔌 TCP connecting to {}", self.remote);
        let stream = TcpStream::connect(self.remote).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }

    fn remote_endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.remote)
    }

    fn supports_timeout(&self) -> bool {
        true
    }
}

/// Binds a TCP listening socket. Port 0 lets the OS pick.
#[derive(Debug, Clone)]
pub struct TcpBinder {
    addr: SocketAddr,
}

impl TcpBinder {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Listen on all IPv4 interfaces.
    pub fn any(port: u16) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Listen on the IPv4 loopback interface.
    pub fn loopback(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn build_socket(&self, config: &ListenerConfig) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))?;

        // Dual-mode only means something on an IPv6 socket
        if self.addr.is_ipv6() {
            socket.set_only_v6(!config.dual_mode)?;
        }
        #[cfg(not(windows))]
        socket.set_reuse_address(true)?;
        socket.set_nodelay(config.nodelay)?;
        socket.set_recv_buffer_size(config.buffer_size)?;
        socket.set_send_buffer_size(config.buffer_size)?;
        socket.set_nonblocking(true)?;

        socket.bind(&self.addr.into())?;
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket.listen(backlog)?;
        Ok(socket)
    }
}

#[async_trait]
impl Binder for TcpBinder {
    type Acceptor = TcpAcceptor;

    async fn bind(&self, config: &ListenerConfig) -> io::Result<TcpAcceptor> {
        let socket = self.build_socket(config)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        tracing::debug!("TCP listener bound on {} (backlog {})", listener.local_addr()?, config.backlog);
        Ok(TcpAcceptor { listener })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.addr)
    }
}

/// Bound TCP listener
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, peer_addr) = self.listener.accept().await?;
        tracing::debug!("🔗 TCP accepted connection from {}", peer_addr);
        Ok(stream)
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        Ok(Endpoint::Tcp(self.listener.local_addr()?))
    }
}
