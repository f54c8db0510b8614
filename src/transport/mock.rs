//! In-memory transport for unit tests

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, DuplexStream, ReadHalf, WriteHalf};

use super::{Endpoint, Transport, TransportWriter};

/// Stream whose peer never writes, so reads stay pending until teardown.
pub(crate) struct MockStream {
    inner: DuplexStream,
    peer: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl MockStream {
    /// New stream plus the switch that breaks its liveness check.
    pub(crate) fn new() -> (Self, Arc<AtomicBool>) {
        let (inner, peer) = tokio::io::duplex(4096);
        let broken = Arc::new(AtomicBool::new(false));
        let stream = Self {
            inner,
            peer,
            broken: broken.clone(),
        };
        (stream, broken)
    }
}

pub(crate) struct MockWriter {
    inner: WriteHalf<DuplexStream>,
    _peer: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportWriter for MockWriter {
    fn probe(&self) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "peer stopped responding"));
        }
        Ok(())
    }
}

impl Transport for MockStream {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = MockWriter;

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::Pipe("mock-local".to_string()))
    }

    fn peer_endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::Pipe("mock-peer".to_string()))
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.inner);
        let writer = MockWriter {
            inner: writer,
            _peer: self.peer,
            broken: self.broken,
        };
        (reader, writer)
    }
}
