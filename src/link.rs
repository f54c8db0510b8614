//! Shared link core
//!
//! The transport state machine used by both client connections and accepted
//! sessions: connected/terminated flags, the write half, the receive loop,
//! the liveness heartbeat and event fan-out.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::event::ConnectionEvent;
use crate::heartbeat::Heartbeat;
use crate::transport::{Endpoint, Transport, TransportWriter};

/// Receives every event a link raises, synchronously and in order.
pub(crate) trait LinkObserver: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent);
}

/// Per-link traffic and lifecycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sends: u64,
    pub receives: u64,
    /// Number of times an attached transport was torn down
    pub terminations: u64,
    /// When the current (or last) transport was attached
    pub connected_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    sends: AtomicU64,
    receives: AtomicU64,
    terminations: AtomicU64,
}

type SharedWriter<W> = Arc<tokio::sync::Mutex<W>>;

pub(crate) struct LinkCore<W: TransportWriter> {
    label: String,
    buffer_size: usize,
    timeout: RwLock<Option<Duration>>,
    connected: AtomicBool,
    /// Starts `true`: nothing attached means nothing to clean up
    terminated: AtomicBool,
    disposed: AtomicBool,
    /// Serializes attach against other attaches and dispose
    attach_lock: Mutex<()>,
    writer: Mutex<Option<SharedWriter<W>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    local: RwLock<Option<Endpoint>>,
    remote: RwLock<Option<Endpoint>>,
    heartbeat: Option<Heartbeat>,
    events: broadcast::Sender<ConnectionEvent>,
    observer: Option<Arc<dyn LinkObserver>>,
    counters: Counters,
    connected_at: Mutex<Option<SystemTime>>,
}

impl<W: TransportWriter> LinkCore<W> {
    /// A `timeout` enables send timeouts and the liveness heartbeat.
    pub(crate) fn new(
        label: String,
        buffer_size: usize,
        timeout: Option<Duration>,
        event_capacity: usize,
        remote: Option<Endpoint>,
        observer: Option<Arc<dyn LinkObserver>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let heartbeat = timeout.and_then(|interval| {
                let weak = weak.clone();
                Heartbeat::new(interval)
                    .map(|heartbeat| {
                        heartbeat.on_expired(move || {
                            if let Some(core) = weak.upgrade() {
                                core.check_liveness();
                            }
                        })
                    })
                    .ok()
            });
            let (events, _) = broadcast::channel(event_capacity);

            Self {
                label,
                buffer_size,
                timeout: RwLock::new(timeout),
                connected: AtomicBool::new(false),
                terminated: AtomicBool::new(true),
                disposed: AtomicBool::new(false),
                attach_lock: Mutex::new(()),
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                local: RwLock::new(None),
                remote: RwLock::new(remote),
                heartbeat,
                events,
                observer,
                counters: Counters::default(),
                connected_at: Mutex::new(None),
            }
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn local_endpoint(&self) -> Option<Endpoint> {
        self.local.read().clone()
    }

    pub(crate) fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote.read().clone()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        *self.timeout.read()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn stats(&self) -> LinkStats {
        LinkStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            sends: self.counters.sends.load(Ordering::Relaxed),
            receives: self.counters.receives.load(Ordering::Relaxed),
            terminations: self.counters.terminations.load(Ordering::Relaxed),
            connected_at: *self.connected_at.lock(),
        }
    }

    /// Swap the timeout and the liveness interval.
    ///
    /// Returns `Ok(false)` when unchanged. Rejected values leave the previous
    /// timeout in place.
    pub(crate) fn set_timeout(&self, timeout: Duration) -> Result<bool, TransportError> {
        crate::config::validate_timeout(timeout)?;
        let mut current = self.timeout.write();
        if *current == Some(timeout) {
            return Ok(false);
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.set_interval(timeout)?;
        }
        *current = Some(timeout);
        Ok(true)
    }

    /// Wire a freshly established transport and start receiving.
    ///
    /// Returns `false` if the link is already connected or disposed; the
    /// stream is dropped in that case.
    pub(crate) fn attach<T>(self: &Arc<Self>, stream: T) -> bool
    where
        T: Transport<Writer = W>,
    {
        let _attach = self.attach_lock.lock();
        if self.is_disposed() || self.is_connected() {
            return false;
        }

        let local = stream.local_endpoint();
        let remote = stream.peer_endpoint();
        let (reader, writer) = stream.into_split();

        *self.local.write() = local;
        if remote.is_some() {
            *self.remote.write() = remote;
        }
        *self.writer.lock() = Some(Arc::new(tokio::sync::Mutex::new(writer)));
        *self.connected_at.lock() = Some(SystemTime::now());
        self.terminated.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        tracing::info!("✅ {} connected (local: {:?}, remote: {:?})", self.label, self.local_endpoint(), self.remote_endpoint());
        self.emit(ConnectionEvent::StatusChanged(true));

        // Receiving is a side effect of the connected transition
        let task = tokio::spawn(receive_loop(Arc::downgrade(self), reader, self.buffer_size));
        {
            let mut slot = self.reader.lock();
            // Lost a race with terminate
            if self.is_terminated() {
                task.abort();
            } else {
                *slot = Some(task);
            }
        }

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.start();
        }
        true
    }

    /// Connected -> disconnected. Returns `false` if already disconnected.
    pub(crate) fn disconnect(&self) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.terminate();
        tracing::info!("🔌 {} disconnected", self.label);
        self.emit(ConnectionEvent::StatusChanged(false));
        true
    }

    /// Tear down the attached transport exactly once per attach.
    pub(crate) fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        // Dropping both halves closes the transport; an in-flight send keeps
        // its own writer handle until it completes.
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        drop(self.writer.lock().take());

        self.counters.terminations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("{} transport terminated", self.label);
        true
    }

    /// Release everything. Idempotent and never fails.
    pub(crate) fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Waits out an attach in progress; later attaches see `disposed`
        let _attach = self.attach_lock.lock();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        self.disconnect();
        self.terminate();
        true
    }

    /// Surface an error unless it is expected teardown noise.
    pub(crate) fn report_error(&self, operation: &str, error: TransportError) {
        if error.is_expected_teardown() {
            tracing::trace!("{} {} ended by teardown: {}", self.label, operation, error);
            return;
        }
        tracing::warn!("⚠️ {} {} failed: {}", self.label, operation, error);
        self.emit(ConnectionEvent::Error(error));
    }

    /// Transport failure while connected: report, then disconnect.
    fn fail(&self, operation: &str, error: TransportError) {
        if !self.is_connected() {
            // Pending operations completing after teardown
            tracing::trace!("{} {} failed after disconnect: {}", self.label, operation, error);
            return;
        }
        self.report_error(operation, error);
        self.disconnect();
    }

    fn writer_for(&self, operation: &'static str) -> Result<SharedWriter<W>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::not_connected(operation));
        }
        self.writer
            .lock()
            .clone()
            .ok_or_else(|| TransportError::not_connected(operation))
    }

    /// One write; reports and returns the prefix actually written.
    ///
    /// Transport failures are absorbed into events and a disconnect; the
    /// return value is then 0.
    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let writer = self.writer_for("send")?;
        if data.is_empty() {
            return Ok(0);
        }

        let timeout = self.timeout();
        let result = {
            let mut guard = writer.lock().await;
            match timeout {
                Some(duration) => match tokio::time::timeout(duration, guard.write(data)).await {
                    Ok(result) => result.map_err(TransportError::from),
                    Err(_) => Err(TransportError::timeout_error("send", duration)),
                },
                None => guard.write(data).await.map_err(TransportError::from),
            }
        };

        match result {
            Ok(0) => {
                self.fail("send", io::Error::from(io::ErrorKind::WriteZero).into());
                Ok(0)
            }
            Ok(sent) => {
                self.record_sent(Bytes::copy_from_slice(&data[..sent]));
                Ok(sent)
            }
            Err(error) => {
                self.fail("send", error);
                Ok(0)
            }
        }
    }

    /// Queue a full write on a background task.
    ///
    /// Only the precondition is checked synchronously. Concurrent calls have
    /// no defined relative order on the wire.
    pub(crate) fn send_async(self: &Arc<Self>, data: Bytes) -> Result<(), TransportError> {
        let writer = self.writer_for("send_async")?;
        if data.is_empty() {
            return Ok(());
        }

        let core = self.clone();
        tokio::spawn(async move {
            let timeout = core.timeout();
            let result = {
                let mut guard = writer.lock().await;
                match timeout {
                    Some(duration) => match tokio::time::timeout(duration, guard.write_all(&data)).await {
                        Ok(result) => result.map_err(TransportError::from),
                        Err(_) => Err(TransportError::timeout_error("send", duration)),
                    },
                    None => guard.write_all(&data).await.map_err(TransportError::from),
                }
            };
            match result {
                Ok(()) => core.record_sent(data),
                Err(error) => core.fail("send", error),
            }
        });
        Ok(())
    }

    fn record_sent(&self, data: Bytes) {
        self.counters.sends.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        tracing::debug!("📤 {} sent {} bytes", self.label, data.len());
        self.emit(ConnectionEvent::DataSent(data));
    }

    fn record_received(&self, data: Bytes) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.reset();
        }
        self.counters.receives.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
        tracing::debug!("📥 {} received {} bytes", self.label, data.len());
        self.emit(ConnectionEvent::DataReceived(data));
    }

    /// Heartbeat expired: nothing arrived for a whole interval, so probe.
    fn check_liveness(&self) {
        if !self.is_connected() {
            return;
        }
        let writer = match self.writer.lock().clone() {
            Some(writer) => writer,
            None => return,
        };
        // A write in progress proves the transport is being used
        let probe = match writer.try_lock() {
            Ok(guard) => guard.probe(),
            Err(_) => return,
        };
        if let Err(error) = probe {
            tracing::info!("💔 {} liveness probe failed: {}", self.label, error);
            self.fail("liveness", error.into());
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<W: TransportWriter> std::fmt::Debug for LinkCore<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCore")
            .field("label", &self.label)
            .field("connected", &self.is_connected())
            .field("terminated", &self.is_terminated())
            .field("remote", &self.remote_endpoint())
            .finish()
    }
}

/// Continuous read loop: each read is re-armed only after the previous
/// chunk has been delivered, so events follow wire order.
async fn receive_loop<R, W>(core: Weak<LinkCore<W>>, mut reader: R, buffer_size: usize)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: TransportWriter,
{
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let result = reader.read(&mut buffer).await;
        let Some(link) = core.upgrade() else {
            break;
        };
        match result {
            Ok(0) => {
                tracing::debug!("📥 {} closed by peer", link.label());
                link.fail("receive", io::Error::from(io::ErrorKind::UnexpectedEof).into());
                break;
            }
            Ok(read) => link.record_received(Bytes::copy_from_slice(&buffer[..read])),
            Err(error) => {
                link.fail("receive", error.into());
                break;
            }
        }
    }
}
