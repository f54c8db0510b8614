use bytes::Bytes;
use std::sync::Arc;

use crate::error::TransportError;
use crate::transport::Endpoint;
use crate::SessionId;

/// Events raised by a single connection or session.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `true` on connect, `false` on disconnect. Fires only on real transitions.
    StatusChanged(bool),
    /// Bytes actually written to the transport
    DataSent(Bytes),
    /// Bytes read from the transport, in wire order
    DataReceived(Bytes),
    /// Unexpected transport error; expected teardown errors never show up here
    Error(TransportError),
}

impl ConnectionEvent {
    pub fn is_status_event(&self) -> bool {
        matches!(self, ConnectionEvent::StatusChanged(_))
    }

    pub fn is_data_event(&self) -> bool {
        matches!(self, ConnectionEvent::DataSent(_) | ConnectionEvent::DataReceived(_))
    }

    pub fn is_error_event(&self) -> bool {
        matches!(self, ConnectionEvent::Error(_))
    }
}

/// Events raised by a listener.
///
/// Generic over the session type so TCP and pipe listeners share one enum.
#[derive(Debug)]
pub enum ListenerEvent<S> {
    /// Listener bound and accepting on this endpoint
    Started(Endpoint),
    /// Listener stopped
    Stopped(Endpoint),
    /// New session accepted and registered
    SessionStarted(Arc<S>),
    /// Session unregistered; `remote` is the peer endpoint captured before removal
    SessionDropped {
        session: SessionId,
        server: Endpoint,
        remote: Option<Endpoint>,
    },
    /// Session connection status flipped
    SessionStatus { session: SessionId, connected: bool },
    DataSent { session: SessionId, data: Bytes },
    DataReceived { session: SessionId, data: Bytes },
    /// Unexpected accept or session error
    Error {
        session: Option<SessionId>,
        error: TransportError,
    },
}

impl<S> Clone for ListenerEvent<S> {
    fn clone(&self) -> Self {
        match self {
            ListenerEvent::Started(endpoint) => ListenerEvent::Started(endpoint.clone()),
            ListenerEvent::Stopped(endpoint) => ListenerEvent::Stopped(endpoint.clone()),
            ListenerEvent::SessionStarted(session) => ListenerEvent::SessionStarted(session.clone()),
            ListenerEvent::SessionDropped { session, server, remote } => ListenerEvent::SessionDropped {
                session: *session,
                server: server.clone(),
                remote: remote.clone(),
            },
            ListenerEvent::SessionStatus { session, connected } => ListenerEvent::SessionStatus {
                session: *session,
                connected: *connected,
            },
            ListenerEvent::DataSent { session, data } => ListenerEvent::DataSent {
                session: *session,
                data: data.clone(),
            },
            ListenerEvent::DataReceived { session, data } => ListenerEvent::DataReceived {
                session: *session,
                data: data.clone(),
            },
            ListenerEvent::Error { session, error } => ListenerEvent::Error {
                session: *session,
                error: error.clone(),
            },
        }
    }
}

impl<S> ListenerEvent<S> {
    /// Session this event concerns, if any
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ListenerEvent::Started(_) | ListenerEvent::Stopped(_) => None,
            ListenerEvent::SessionStarted(_) => None,
            ListenerEvent::SessionDropped { session, .. } => Some(*session),
            ListenerEvent::SessionStatus { session, .. } => Some(*session),
            ListenerEvent::DataSent { session, .. } => Some(*session),
            ListenerEvent::DataReceived { session, .. } => Some(*session),
            ListenerEvent::Error { session, .. } => *session,
        }
    }

    pub fn is_error_event(&self) -> bool {
        matches!(self, ListenerEvent::Error { .. })
    }
}
