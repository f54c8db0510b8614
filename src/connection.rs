//! Client connection
//!
//! One bidirectional byte-stream endpoint dialed through a [`Connector`].
//! The transport is replaced wholesale on every connect; reconnecting after a
//! disconnect is allowed.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::event::ConnectionEvent;
use crate::link::{LinkCore, LinkStats};
use crate::transport::{Connector, Endpoint, Transport};

type Writer<C> = <<C as Connector>::Stream as Transport>::Writer;

/// Client-side connection over any [`Connector`]
pub struct Connection<C: Connector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    core: Arc<LinkCore<Writer<C>>>,
    connecting: Arc<AtomicBool>,
    /// Serializes connect completion against cancellation
    connect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<C: Connector> Connection<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let remote = connector.remote_endpoint();
        let timeout = connector.supports_timeout().then_some(config.timeout);
        let core = LinkCore::new(
            format!("connection {}", remote),
            config.buffer_size,
            timeout,
            config.event_capacity,
            Some(remote),
            None,
        );

        Ok(Self {
            connector: Arc::new(connector),
            config,
            core,
            connecting: Arc::new(AtomicBool::new(false)),
            connect_task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Local endpoint, known only once connected.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.core.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.core.remote_endpoint()
    }

    pub fn stats(&self) -> LinkStats {
        self.core.stats()
    }

    /// Subscribe to status, data and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.subscribe()
    }

    /// Current timeout; `None` for transports without timeouts.
    pub fn timeout(&self) -> Option<Duration> {
        self.core.timeout()
    }

    /// Change the connect/send timeout and liveness interval.
    ///
    /// Zero and `Duration::MAX` are rejected and the previous value is kept.
    /// Returns `Ok(false)` when the value is unchanged.
    pub fn set_timeout(&self, timeout: Duration) -> Result<bool, TransportError> {
        if !self.connector.supports_timeout() {
            return Err(TransportError::invalid_operation(
                "set_timeout",
                "transport does not support timeouts",
            ));
        }
        self.core.set_timeout(timeout)
    }

    /// Dial and wait for the handshake.
    ///
    /// Returns `true` if this call established the connection. A no-op while
    /// already connected or connecting, and after `dispose`. Transport failures are reported
    /// through events rather than returned.
    pub async fn connect(&self) -> bool {
        if self.core.is_disposed() || self.core.is_connected() || self.connecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let result = dial(&*self.connector, self.core.timeout()).await;
        complete_connect(&self.core, &self.connecting, &self.connect_task, result)
    }

    /// Dial on a background task. Returns `false` if already connected,
    /// connecting or disposed. Must be called from within a tokio runtime.
    pub fn begin_connecting(&self) -> bool {
        if self.core.is_disposed() || self.core.is_connected() || self.connecting.swap(true, Ordering::AcqRel) {
            return false;
        }

        let connector = self.connector.clone();
        let core = self.core.clone();
        let connecting = self.connecting.clone();
        let gate = self.connect_task.clone();
        let timeout = core.timeout();

        let task = tokio::spawn(async move {
            let result = dial(&*connector, timeout).await;
            complete_connect(&core, &connecting, &gate, result);
            gate.lock().take();
        });

        let mut slot = self.connect_task.lock();
        if !task.is_finished() {
            *slot = Some(task);
        }
        true
    }

    /// Cancel an in-flight connect, or tear down the connected transport.
    ///
    /// Returns `false` when neither connected nor connecting.
    pub fn disconnect(&self) -> bool {
        {
            let mut gate = self.connect_task.lock();
            if self.connecting.swap(false, Ordering::AcqRel) {
                if let Some(task) = gate.take() {
                    task.abort();
                }
                tracing::debug!("{} connect cancelled", self.core.label());
                return true;
            }
        }
        self.core.disconnect()
    }

    /// Write once and return the number of bytes actually sent.
    ///
    /// Fails with an invalid-operation error when not connected. Transport
    /// failures disconnect the link, raise an error event and return `Ok(0)`.
    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.core.send(data).await
    }

    /// Queue the whole buffer for sending on a background task.
    pub fn send_async(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.core.send_async(data.into())
    }

    /// Stop timers, disconnect and release the transport. Idempotent.
    pub fn dispose(&self) {
        self.disconnect();
        if self.core.dispose() {
            tracing::debug!("{} disposed", self.core.label());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

async fn dial<C: Connector>(connector: &C, timeout: Option<Duration>) -> Result<C::Stream, TransportError> {
    match timeout {
        Some(duration) => match tokio::time::timeout(duration, connector.connect()).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::timeout_error("connect", duration)),
        },
        None => connector.connect().await.map_err(TransportError::from),
    }
}

/// Finish a connect attempt unless it was cancelled meanwhile.
fn complete_connect<T: Transport>(
    core: &Arc<LinkCore<T::Writer>>,
    connecting: &AtomicBool,
    gate: &Mutex<Option<JoinHandle<()>>>,
    result: Result<T, TransportError>,
) -> bool {
    let _gate = gate.lock();
    if !connecting.swap(false, Ordering::AcqRel) {
        // Cancelled by disconnect; the stream (if any) is dropped here
        return false;
    }
    match result {
        Ok(stream) => core.attach(stream),
        Err(error) => {
            core.report_error("connect", error);
            core.terminate();
            false
        }
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C: Connector> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote_endpoint())
            .field("connected", &self.is_connected())
            .field("connecting", &self.is_connecting())
            .finish()
    }
}

#[cfg(feature = "tcp")]
mod tcp_impl {
    use super::*;
    use crate::transport::TcpConnector;
    use std::net::SocketAddr;

    /// TCP client connection
    pub type TcpConnection = Connection<TcpConnector>;

    impl Connection<TcpConnector> {
        /// TCP connection to a fixed remote address.
        pub fn tcp(remote: SocketAddr, config: ConnectionConfig) -> Result<Self, TransportError> {
            let connector = TcpConnector::new(remote).with_nodelay(config.nodelay);
            Self::new(connector, config)
        }
    }
}

#[cfg(feature = "tcp")]
pub use tcp_impl::TcpConnection;

#[cfg(feature = "pipe")]
mod pipe_impl {
    use super::*;
    use crate::transport::PipeConnector;

    /// Pipe client connection
    pub type PipeConnection = Connection<PipeConnector>;

    impl Connection<PipeConnector> {
        /// Pipe connection to `name` on `server` (`.` for the local machine).
        pub fn pipe(
            server: impl Into<String>,
            name: impl Into<String>,
            config: ConnectionConfig,
        ) -> Result<Self, TransportError> {
            Self::new(PipeConnector::new(server, name), config)
        }
    }
}

#[cfg(feature = "pipe")]
pub use pipe_impl::PipeConnection;
