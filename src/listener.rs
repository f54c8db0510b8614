//! Listener
//!
//! Accept loop plus the live session registry. Every accepted transport is
//! wrapped in a [`Session`], connected, registered and announced; sessions
//! leave the registry when they disconnect, when unregistered explicitly, or
//! when the listener stops.

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::error::TransportError;
use crate::event::{ConnectionEvent, ListenerEvent};
use crate::session::{Session, SessionOwner};
use crate::transport::{AcceptedStream, Acceptor, Binder, Endpoint, Transport};
use crate::SessionId;

/// Back-off after a failed accept before re-arming
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Session type produced by a binder
pub type SessionOf<B> = Session<AcceptedStream<B>>;

type Registry<B> = IndexMap<SessionId, Arc<SessionOf<B>>>;

struct ListenerShared<B: Binder> {
    id: u64,
    binder: B,
    config: ListenerConfig,
    endpoint: RwLock<Endpoint>,
    listening: AtomicBool,
    /// In registration order
    sessions: RwLock<Registry<B>>,
    next_session: AtomicU64,
    accept_task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    events: broadcast::Sender<ListenerEvent<SessionOf<B>>>,
    self_ref: Weak<ListenerShared<B>>,
}

/// Accepts transports from a [`Binder`] and tracks the resulting sessions
pub struct Listener<B: Binder> {
    shared: Arc<ListenerShared<B>>,
}

impl<B: Binder> Listener<B> {
    pub fn new(binder: B, config: ListenerConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let endpoint = binder.endpoint();
        let (events, _) = broadcast::channel(config.event_capacity);

        let shared = Arc::new_cyclic(|self_ref| ListenerShared {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            binder,
            config,
            endpoint: RwLock::new(endpoint),
            listening: AtomicBool::new(false),
            sessions: RwLock::new(IndexMap::new()),
            next_session: AtomicU64::new(1),
            accept_task: Mutex::new(None),
            events,
            self_ref: self_ref.clone(),
        });
        Ok(Self { shared })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.shared.config
    }

    /// Bound endpoint; reflects the OS-assigned port once started.
    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint.read().clone()
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent<SessionOf<B>>> {
        self.shared.events.subscribe()
    }

    /// Bind, listen and start the accept loop.
    ///
    /// Returns `Ok(false)` if already listening. Bind failures are returned
    /// to the caller and leave the listener stopped.
    pub async fn start(&self) -> Result<bool, TransportError> {
        let shared = &self.shared;
        if shared.listening.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let acceptor = match shared.binder.bind(&shared.config).await {
            Ok(acceptor) => acceptor,
            Err(error) => {
                shared.listening.store(false, Ordering::Release);
                tracing::error!("❌ Listener bind on {} failed: {}", shared.binder.endpoint(), error);
                return Err(error.into());
            }
        };
        let endpoint = match acceptor.local_endpoint() {
            Ok(endpoint) => endpoint,
            Err(error) => {
                shared.listening.store(false, Ordering::Release);
                return Err(error.into());
            }
        };
        *shared.endpoint.write() = endpoint.clone();

        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(shared.self_ref.clone(), acceptor, token.clone()));
        *shared.accept_task.lock() = Some((task, token));

        tracing::info!("🌐 Listener started on {}", endpoint);
        shared.emit(ListenerEvent::Started(endpoint));
        Ok(true)
    }

    /// Stop accepting, close the listening transport and disconnect every session.
    ///
    /// Returns `false` if not listening.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    /// Snapshot of the registered sessions in registration order.
    pub fn sessions(&self) -> Vec<Arc<SessionOf<B>>> {
        self.shared.sessions.read().values().cloned().collect()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<SessionOf<B>>> {
        self.shared.sessions.read().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.read().len()
    }

    /// Create an unconnected, unregistered session owned by this listener.
    pub fn create_session(&self) -> Arc<SessionOf<B>> {
        Arc::new(self.shared.new_session())
    }

    /// Add a session to the registry.
    ///
    /// Returns `Ok(false)` if it is already registered. Sessions created by
    /// another listener are rejected.
    pub fn register_session(&self, session: Arc<SessionOf<B>>) -> Result<bool, TransportError> {
        self.shared.register_session(session)
    }

    /// Remove a session from the registry, then disconnect and dispose it.
    ///
    /// Returns `false` for sessions that are not registered.
    pub fn unregister_session(&self, id: SessionId) -> bool {
        self.shared.drop_session(id)
    }

    /// Unregister every session present right now. Returns how many were dropped.
    pub fn disconnect_all(&self) -> usize {
        self.shared.disconnect_all()
    }

    /// Best-effort send to every registered session.
    ///
    /// Failures are handled by each session's own error path. Returns the
    /// number of sessions the data was queued for.
    pub fn multicast(&self, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        let sessions = self.sessions();
        let mut queued = 0;
        for session in sessions {
            match session.send_async(data.clone()) {
                Ok(()) => queued += 1,
                Err(error) => tracing::debug!("multicast skipped {}: {}", session.id(), error),
            }
        }
        queued
    }
}

impl<B: Binder> ListenerShared<B> {
    fn emit(&self, event: ListenerEvent<SessionOf<B>>) {
        let _ = self.events.send(event);
    }

    fn new_session(&self) -> SessionOf<B> {
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        let owner: Weak<dyn SessionOwner> = self.self_ref.clone();
        Session::new(
            id,
            self.id,
            owner,
            self.config.buffer_size,
            self.config.session_timeout,
            self.config.nodelay,
            self.config.event_capacity,
        )
    }

    fn register_session(&self, session: Arc<SessionOf<B>>) -> Result<bool, TransportError> {
        if session.owner_id() != self.id {
            return Err(TransportError::invalid_operation(
                "register_session",
                format!("{} belongs to another listener", session.id()),
            ));
        }
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id()) {
            return Ok(false);
        }
        sessions.insert(session.id(), session);
        Ok(true)
    }

    /// Remove, dispose and announce. Exactly one caller wins per session.
    fn drop_session(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().shift_remove(&id);
        let Some(session) = removed else {
            return false;
        };
        // Captured before dispose touches the session
        let remote = session.remote_endpoint();
        session.dispose();

        tracing::info!("🧹 {} dropped (remote: {:?})", id, remote);
        self.emit(ListenerEvent::SessionDropped {
            session: id,
            server: self.endpoint.read().clone(),
            remote,
        });
        true
    }

    fn disconnect_all(&self) -> usize {
        // Snapshot: sessions disconnecting concurrently mutate the registry
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        ids.into_iter().filter(|id| self.drop_session(*id)).count()
    }

    fn on_accepted(&self, stream: AcceptedStream<B>) {
        if let Some(limit) = self.binder.session_limit(&self.config) {
            if self.sessions.read().len() >= limit {
                // Dropping the stream closes it
                tracing::warn!("⚠️ Session limit {} reached, refusing {:?}", limit, stream.peer_endpoint());
                return;
            }
        }
        let session = Arc::new(self.new_session());
        let id = session.id();
        session.connect(stream);

        match self.register_session(session.clone()) {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        // Closed before it was registered, or raced with stop
        if !session.is_connected() || !self.listening.load(Ordering::Acquire) {
            self.sessions.write().shift_remove(&id);
            session.dispose();
            return;
        }

        tracing::info!("✅ {} accepted from {:?}", id, session.remote_endpoint());
        self.emit(ListenerEvent::SessionStarted(session));
    }

    fn report_accept_error(&self, error: TransportError) {
        if error.is_expected_teardown() {
            tracing::trace!("accept ended by teardown: {}", error);
            return;
        }
        tracing::error!("❌ accept failed: {}", error);
        self.emit(ListenerEvent::Error { session: None, error });
    }

    fn stop(&self) -> bool {
        if !self.listening.swap(false, Ordering::AcqRel) {
            return false;
        }
        // Dropping the acceptor with the task closes the listening transport
        if let Some((task, token)) = self.accept_task.lock().take() {
            token.cancel();
            task.abort();
        }
        let dropped = self.disconnect_all();

        let endpoint = self.endpoint.read().clone();
        tracing::info!("🛑 Listener on {} stopped ({} sessions disconnected)", endpoint, dropped);
        self.emit(ListenerEvent::Stopped(endpoint));
        true
    }
}

impl<B: Binder> SessionOwner for ListenerShared<B> {
    fn session_event(&self, session: SessionId, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged(connected) => {
                self.emit(ListenerEvent::SessionStatus {
                    session,
                    connected: *connected,
                });
                if !*connected {
                    self.drop_session(session);
                }
            }
            ConnectionEvent::DataSent(data) => self.emit(ListenerEvent::DataSent {
                session,
                data: data.clone(),
            }),
            ConnectionEvent::DataReceived(data) => self.emit(ListenerEvent::DataReceived {
                session,
                data: data.clone(),
            }),
            ConnectionEvent::Error(error) => self.emit(ListenerEvent::Error {
                session: Some(session),
                error: error.clone(),
            }),
        }
    }
}

/// Accept until cancelled. A failed accept never ends the loop.
async fn accept_loop<B: Binder>(shared: Weak<ListenerShared<B>>, mut acceptor: B::Acceptor, token: CancellationToken) {
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = acceptor.accept() => result,
        };
        let Some(listener) = shared.upgrade() else {
            break;
        };
        match result {
            Ok(stream) => listener.on_accepted(stream),
            Err(error) => {
                listener.report_accept_error(error.into());
                drop(listener);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    tracing::debug!("accept loop finished");
}

impl<B: Binder> Drop for Listener<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<B: Binder> std::fmt::Debug for Listener<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint())
            .field("listening", &self.is_listening())
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(feature = "tcp")]
mod tcp_impl {
    use super::*;
    use crate::transport::TcpBinder;
    use std::net::SocketAddr;

    /// TCP listener
    pub type TcpListener = Listener<TcpBinder>;

    impl Listener<TcpBinder> {
        /// Listener on `addr`; port 0 lets the OS pick.
        pub fn tcp(addr: SocketAddr, config: ListenerConfig) -> Result<Self, TransportError> {
            Self::new(TcpBinder::new(addr), config)
        }
    }
}

#[cfg(feature = "tcp")]
pub use tcp_impl::TcpListener;

#[cfg(feature = "pipe")]
mod pipe_impl {
    use super::*;
    use crate::transport::PipeBinder;

    /// Pipe listener
    pub type PipeListener = Listener<PipeBinder>;

    impl Listener<PipeBinder> {
        /// Listener on the local pipe `name`.
        pub fn pipe(name: impl Into<String>, config: ListenerConfig) -> Result<Self, TransportError> {
            Self::new(PipeBinder::new(name), config)
        }
    }
}

#[cfg(feature = "pipe")]
pub use pipe_impl::PipeListener;


#[cfg(test)]
mod accept_tests {
    use super::*;
    use crate::transport::mock::MockStream;
    use async_trait::async_trait;
    use std::io;

    /// Fails the first `failures` accepts, then hands out `streams` streams.
    struct ScriptedBinder {
        failures: usize,
        streams: usize,
        limit: Option<usize>,
    }

    struct ScriptedAcceptor {
        failures: usize,
        streams: usize,
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        type Stream = MockStream;

        async fn accept(&mut self) -> io::Result<MockStream> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
            }
            if self.streams > 0 {
                self.streams -= 1;
                return Ok(MockStream::new().0);
            }
            std::future::pending().await
        }

        fn local_endpoint(&self) -> io::Result<Endpoint> {
            Ok(Endpoint::Pipe("scripted".to_string()))
        }
    }

    #[async_trait]
    impl Binder for ScriptedBinder {
        type Acceptor = ScriptedAcceptor;

        async fn bind(&self, _config: &ListenerConfig) -> io::Result<ScriptedAcceptor> {
            Ok(ScriptedAcceptor {
                failures: self.failures,
                streams: self.streams,
            })
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::Pipe("scripted".to_string())
        }

        fn session_limit(&self, _config: &ListenerConfig) -> Option<usize> {
            self.limit
        }
    }

    fn scripted(failures: usize, streams: usize, limit: Option<usize>) -> Listener<ScriptedBinder> {
        let binder = ScriptedBinder { failures, streams, limit };
        Listener::new(binder, ListenerConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_is_reported_and_loop_rearms() {
        let listener = scripted(2, 1, None);
        let mut events = listener.subscribe();
        assert!(listener.start().await.unwrap());

        let mut errors = 0;
        let session = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ListenerEvent::Error { session: None, error } => {
                    assert_eq!(error.io_kind(), Some(io::ErrorKind::Other));
                    errors += 1;
                }
                ListenerEvent::SessionStarted(session) => break session,
                _ => {}
            }
        };

        assert_eq!(errors, 2);
        assert!(session.is_connected());
        assert!(listener.is_listening());
        assert_eq!(listener.session_count(), 1);
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_limit_drops_surplus_streams() {
        let listener = scripted(0, 3, Some(2));
        let mut events = listener.subscribe();
        assert!(listener.start().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(listener.session_count(), 2);
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ListenerEvent::SessionStarted(_)) {
                started += 1;
            }
        }
        assert_eq!(started, 2);
        listener.stop();
    }

    #[tokio::test]
    async fn test_disposed_session_refuses_stream() {
        let listener = scripted(0, 0, None);
        let session = listener.create_session();
        session.dispose();

        let (stream, _) = MockStream::new();
        assert!(!session.connect(stream));
        assert!(!session.is_connected());
        assert_eq!(session.stats().terminations, 0);
    }
}
