//! Local pipe transport
//!
//! A pipe is addressed by server name + pipe name. On Unix it is a Unix domain
//! socket under a pipe directory (the system temp dir unless overridden), and
//! only the local server (`.` or `localhost`) is reachable. On Windows it is a
//! named pipe at `\\<server>\pipe\<name>`.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

use super::{Acceptor, Binder, Connector, Endpoint, Transport, TransportWriter};
use crate::config::ListenerConfig;

/// Server name meaning "this machine"
pub const LOCAL_SERVER: &str = ".";

fn is_local_server(server: &str) -> bool {
    server == LOCAL_SERVER || server.eq_ignore_ascii_case("localhost")
}

/// Resolve a pipe name to its filesystem path on Unix.
pub fn pipe_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.pipe", name))
}

/// Established pipe stream
pub struct PipeStream {
    name: String,
    /// `server/name` on the client side; clients have no address of their own
    peer: String,
    #[cfg(unix)]
    inner: tokio::net::UnixStream,
    #[cfg(windows)]
    inner: windows_impl::PipeInner,
}

impl std::fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeStream")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Dials a named pipe on a (local) server.
#[derive(Debug, Clone)]
pub struct PipeConnector {
    server: String,
    name: String,
    #[cfg_attr(windows, allow(dead_code))]
    dir: PathBuf,
}

impl PipeConnector {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            dir: std::env::temp_dir(),
        }
    }

    /// Pipe on the local machine
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(LOCAL_SERVER, name)
    }

    /// Directory holding pipe sockets (Unix only)
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `server/name`, as reported by the remote endpoint
    pub fn address(&self) -> String {
        format!("{}/{}", self.server, self.name)
    }
}

/// Creates pipe server instances for a pipe name.
#[derive(Debug, Clone)]
pub struct PipeBinder {
    name: String,
    #[cfg_attr(windows, allow(dead_code))]
    dir: PathBuf,
}

impl PipeBinder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: std::env::temp_dir(),
        }
    }

    /// Directory holding pipe sockets (Unix only)
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{UnixListener, UnixStream};

    impl TransportWriter for OwnedWriteHalf {
        fn probe(&self) -> io::Result<()> {
            match self.as_ref().take_error()? {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    impl Transport for PipeStream {
        type Reader = OwnedReadHalf;
        type Writer = OwnedWriteHalf;

        fn local_endpoint(&self) -> Option<Endpoint> {
            Some(Endpoint::Pipe(self.name.clone()))
        }

        fn peer_endpoint(&self) -> Option<Endpoint> {
            Some(Endpoint::Pipe(self.peer.clone()))
        }

        fn into_split(self) -> (Self::Reader, Self::Writer) {
            self.inner.into_split()
        }
    }

    #[async_trait]
    impl Connector for PipeConnector {
        type Stream = PipeStream;

        async fn connect(&self) -> io::Result<PipeStream> {
            if !is_local_server(&self.server) {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("remote pipe server '{}' is not reachable on this platform", self.server),
                ));
            }
            let path = pipe_path(&self.dir, &self.name);
            tracing::debug!("🔌 Pipe connecting to {}", path.display());
            let inner = UnixStream::connect(&path).await?;
            Ok(PipeStream {
                name: self.name.clone(),
                peer: self.address(),
                inner,
            })
        }

        fn remote_endpoint(&self) -> Endpoint {
            Endpoint::Pipe(self.address())
        }
    }

    /// Bind, replacing a stale socket file left by a previous process.
    async fn bind_path(path: &Path) -> io::Result<UnixListener> {
        match UnixListener::bind(path) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
            Err(e) => return Err(e),
        }

        let metadata = tokio::fs::symlink_metadata(path).await?;
        if !metadata.file_type().is_socket() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "pipe path exists and is not a socket",
            ));
        }
        // A live server would accept this
        if UnixStream::connect(path).await.is_ok() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "pipe name already in use"));
        }
        tokio::fs::remove_file(path).await?;
        UnixListener::bind(path)
    }

    #[async_trait]
    impl Binder for PipeBinder {
        type Acceptor = PipeAcceptor;

        async fn bind(&self, config: &ListenerConfig) -> io::Result<PipeAcceptor> {
            let path = pipe_path(&self.dir, &self.name);
            let listener = bind_path(&path).await?;
            tracing::debug!("Pipe listener bound on {} (max {} sessions)", path.display(), config.max_instances);
            Ok(PipeAcceptor {
                name: self.name.clone(),
                path,
                listener,
            })
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::Pipe(self.name.clone())
        }

        fn session_limit(&self, config: &ListenerConfig) -> Option<usize> {
            Some(config.max_instances)
        }
    }

    /// Bound pipe listener; removes its socket file on drop.
    #[derive(Debug)]
    pub struct PipeAcceptor {
        name: String,
        path: PathBuf,
        listener: UnixListener,
    }

    #[async_trait]
    impl Acceptor for PipeAcceptor {
        type Stream = PipeStream;

        async fn accept(&mut self) -> io::Result<PipeStream> {
            let (inner, _) = self.listener.accept().await?;
            tracing::debug!("🔗 Pipe client connected on {}", self.name);
            Ok(PipeStream {
                name: self.name.clone(),
                peer: self.name.clone(),
                inner,
            })
        }

        fn local_endpoint(&self) -> io::Result<Endpoint> {
            Ok(Endpoint::Pipe(self.name.clone()))
        }
    }

    impl Drop for PipeAcceptor {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
pub use unix_impl::PipeAcceptor;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

    /// Either end of a named pipe
    pub enum PipeInner {
        Client(NamedPipeClient),
        Server(NamedPipeServer),
    }

    fn full_name(server: &str, name: &str) -> String {
        format!(r"\\{}\pipe\{}", server, name)
    }

    /// Write half of a named pipe. Named pipes expose no pending-error query.
    pub struct PipeWriter(tokio::io::WriteHalf<PipeInner>);

    impl AsyncRead for PipeInner {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                PipeInner::Client(pipe) => Pin::new(pipe).poll_read(cx, buf),
                PipeInner::Server(pipe) => Pin::new(pipe).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeInner {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            match self.get_mut() {
                PipeInner::Client(pipe) => Pin::new(pipe).poll_write(cx, buf),
                PipeInner::Server(pipe) => Pin::new(pipe).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                PipeInner::Client(pipe) => Pin::new(pipe).poll_flush(cx),
                PipeInner::Server(pipe) => Pin::new(pipe).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                PipeInner::Client(pipe) => Pin::new(pipe).poll_shutdown(cx),
                PipeInner::Server(pipe) => Pin::new(pipe).poll_shutdown(cx),
            }
        }
    }

    impl AsyncWrite for PipeWriter {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl TransportWriter for PipeWriter {
        fn probe(&self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for PipeStream {
        type Reader = tokio::io::ReadHalf<PipeInner>;
        type Writer = PipeWriter;

        fn local_endpoint(&self) -> Option<Endpoint> {
            Some(Endpoint::Pipe(self.name.clone()))
        }

        fn peer_endpoint(&self) -> Option<Endpoint> {
            Some(Endpoint::Pipe(self.peer.clone()))
        }

        fn into_split(self) -> (Self::Reader, Self::Writer) {
            let (reader, writer) = tokio::io::split(self.inner);
            (reader, PipeWriter(writer))
        }
    }

    #[async_trait]
    impl Connector for PipeConnector {
        type Stream = PipeStream;

        async fn connect(&self) -> io::Result<PipeStream> {
            let full = full_name(&self.server, &self.name);
            tracing::debug!("🔌 Pipe connecting to {}", full);
            let client = ClientOptions::new().open(&full)?;
            Ok(PipeStream {
                name: self.name.clone(),
                peer: self.address(),
                inner: PipeInner::Client(client),
            })
        }

        fn remote_endpoint(&self) -> Endpoint {
            Endpoint::Pipe(self.address())
        }
    }

    #[async_trait]
    impl Binder for PipeBinder {
        type Acceptor = PipeAcceptor;

        async fn bind(&self, config: &ListenerConfig) -> io::Result<PipeAcceptor> {
            let full = full_name(LOCAL_SERVER, &self.name);
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .max_instances(config.max_instances)
                .create(&full)?;
            Ok(PipeAcceptor {
                name: self.name.clone(),
                full,
                max_instances: config.max_instances,
                next,
            })
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::Pipe(self.name.clone())
        }

        fn session_limit(&self, config: &ListenerConfig) -> Option<usize> {
            Some(config.max_instances)
        }
    }

    /// Pipe server; keeps one pending instance waiting for the next client.
    pub struct PipeAcceptor {
        name: String,
        full: String,
        max_instances: usize,
        next: NamedPipeServer,
    }

    #[async_trait]
    impl Acceptor for PipeAcceptor {
        type Stream = PipeStream;

        async fn accept(&mut self) -> io::Result<PipeStream> {
            self.next.connect().await?;
            let fresh = ServerOptions::new()
                .max_instances(self.max_instances)
                .create(&self.full)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            Ok(PipeStream {
                name: self.name.clone(),
                peer: self.name.clone(),
                inner: PipeInner::Server(connected),
            })
        }

        fn local_endpoint(&self) -> io::Result<Endpoint> {
            Ok(Endpoint::Pipe(self.name.clone()))
        }
    }
}

#[cfg(windows)]
pub use windows_impl::PipeAcceptor;
