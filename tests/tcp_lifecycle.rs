//! TCP lifecycle integration tests
//!
//! Covers:
//! 1. Client connect/disconnect status events fire exactly once
//! 2. Listener echo round trips and byte ordering
//! 3. Errors suppressed on peer reset
//! 4. Registry consistency when stop races session disconnects

#![cfg(feature = "tcp")]

use linkwire::{
    Connection, ConnectionConfig, ConnectionEvent, Listener, ListenerConfig, ListenerEvent, TcpListener, TcpSession,
    TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_listener(config: ListenerConfig) -> (Arc<TcpListener>, SocketAddr) {
    let listener = Arc::new(Listener::tcp("127.0.0.1:0".parse().unwrap(), config).unwrap());
    assert!(listener.start().await.unwrap());
    let addr = listener.endpoint().as_socket_addr().unwrap();
    (listener, addr)
}

/// Echo every received chunk back to the session it came from.
fn spawn_echo(listener: Arc<TcpListener>) -> JoinHandle<()> {
    let mut events = listener.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ListenerEvent::DataReceived { session, data } = event {
                let Some(session) = listener.session(session) else {
                    continue;
                };
                let mut offset = 0;
                while offset < data.len() {
                    match session.send(&data[offset..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(sent) => offset += sent,
                    }
                }
            }
        }
    })
}

async fn wait_for<T, F>(events: &mut broadcast::Receiver<T>, mut matches: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect received bytes until `len` have arrived.
async fn receive_exact(events: &mut broadcast::Receiver<ConnectionEvent>, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    while received.len() < len {
        let event = wait_for(events, |event| matches!(event, ConnectionEvent::DataReceived(_))).await;
        if let ConnectionEvent::DataReceived(data) = event {
            received.extend_from_slice(&data);
        }
    }
    received
}

fn drain<T: Clone>(events: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn test_ping_pong_round_trip() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let mut server_events = listener.subscribe();

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut events = client.subscribe();
    assert!(client.connect().await);
    assert!(client.is_connected());
    assert!(client.local_endpoint().is_some());

    assert_eq!(client.send(b"ping").await.unwrap(), 4);

    let mut ping = Vec::new();
    let mut from = None;
    while ping.len() < 4 {
        let event = wait_for(&mut server_events, |event| matches!(event, ListenerEvent::DataReceived { .. })).await;
        if let ListenerEvent::DataReceived { session, data } = event {
            ping.extend_from_slice(&data);
            from = Some(session);
        }
    }
    assert_eq!(ping, b"ping");

    let session = listener.session(from.unwrap()).unwrap();
    assert_eq!(session.send(b"pong").await.unwrap(), 4);
    assert_eq!(receive_exact(&mut events, 4).await, b"pong");

    let stats = client.stats();
    assert_eq!(stats.bytes_sent, 4);
    assert_eq!(stats.bytes_received, 4);
    assert_eq!(stats.sends, 1);
    assert!(stats.connected_at.is_some());

    listener.stop();
}

#[tokio::test]
async fn test_status_changes_fire_exactly_once() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut events = client.subscribe();

    assert!(client.connect().await);
    assert!(!client.connect().await);
    assert!(client.disconnect());
    assert!(!client.disconnect());

    let statuses: Vec<bool> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::StatusChanged(connected) => Some(connected),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![true, false]);
    assert_eq!(client.stats().terminations, 1);

    listener.stop();
}

#[tokio::test]
async fn test_send_after_disconnect_is_invalid_operation() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    assert!(client.connect().await);
    client.disconnect();

    let err = client.send(b"late").await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidOperation { .. }));
    assert!(client.send_async(&b"late"[..]).is_err());

    listener.stop();
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut events = client.subscribe();
    assert!(client.connect().await);

    client.dispose();
    client.dispose();
    assert!(client.is_disposed());
    assert!(!client.is_connected());
    assert_eq!(client.stats().terminations, 1);

    let disconnects = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, ConnectionEvent::StatusChanged(false)))
        .count();
    assert_eq!(disconnects, 1);

    listener.stop();
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let echo = spawn_echo(listener.clone());

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut events = client.subscribe();

    assert!(client.connect().await);
    assert!(client.disconnect());
    assert!(client.connect().await);

    assert_eq!(client.send(b"again").await.unwrap(), 5);
    assert_eq!(receive_exact(&mut events, 5).await, b"again");
    assert_eq!(client.stats().terminations, 1);

    echo.abort();
    listener.stop();
}

#[tokio::test]
async fn test_large_payload_keeps_byte_order() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let echo = spawn_echo(listener.clone());

    let client = Connection::tcp(addr, ConnectionConfig::default().with_buffer_size(1024)).unwrap();
    let mut events = client.subscribe();
    assert!(client.connect().await);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let mut offset = 0;
    while offset < payload.len() {
        let sent = client.send(&payload[offset..]).await.unwrap();
        assert!(sent > 0);
        offset += sent;
    }

    let echoed = receive_exact(&mut events, payload.len()).await;
    assert_eq!(echoed, payload);

    echo.abort();
    listener.stop();
}

#[tokio::test]
async fn test_zero_timeout_rejected() {
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let err = Connection::tcp(addr, ConnectionConfig::default().with_timeout(Duration::ZERO)).unwrap_err();
    assert!(matches!(err, TransportError::Configuration { .. }));

    let err = Listener::tcp(
        addr,
        ListenerConfig::default().with_session_timeout(Some(Duration::ZERO)),
    )
    .unwrap_err();
    assert!(matches!(err, TransportError::Configuration { .. }));
}

#[tokio::test]
async fn test_begin_connecting_then_cancel() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut events = client.subscribe();

    assert!(client.begin_connecting());
    assert!(!client.begin_connecting());
    assert!(client.disconnect());
    assert!(!client.is_connecting());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_connected());
    assert!(drain(&mut events).iter().all(|event| !event.is_status_event()));

    assert!(client.begin_connecting());
    wait_for(&mut events, |event| matches!(event, ConnectionEvent::StatusChanged(true))).await;
    assert!(client.is_connected());
    assert!(!client.is_connecting());

    listener.stop();
}

#[tokio::test]
async fn test_session_dropped_when_client_closes() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let mut server_events = listener.subscribe();

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    assert!(client.connect().await);
    let client_local = client.local_endpoint();

    let started = wait_for(&mut server_events, |event| matches!(event, ListenerEvent::SessionStarted(_))).await;
    let ListenerEvent::SessionStarted(session) = started else {
        unreachable!()
    };
    assert_eq!(session.remote_endpoint(), client_local);
    assert_eq!(listener.session_count(), 1);

    client.disconnect();

    let dropped = wait_for(&mut server_events, |event| {
        matches!(event, ListenerEvent::SessionDropped { .. })
    })
    .await;
    let ListenerEvent::SessionDropped { session: id, server, remote } = dropped else {
        unreachable!()
    };
    assert_eq!(id, session.id());
    assert_eq!(server, listener.endpoint());
    assert_eq!(remote, client_local);
    assert_eq!(listener.session_count(), 0);
    assert!(session.is_disposed());

    listener.stop();
}

#[tokio::test]
async fn test_peer_reset_is_not_reported_as_error() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let mut server_events = listener.subscribe();

    let raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_for(&mut server_events, |event| matches!(event, ListenerEvent::SessionStarted(_))).await;

    // Linger zero turns the close into an RST
    socket2::SockRef::from(&raw).set_linger(Some(Duration::ZERO)).unwrap();
    drop(raw);

    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            let event = server_events.recv().await.unwrap();
            let done = matches!(event, ListenerEvent::SessionDropped { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("session was not dropped");

    assert!(seen.iter().all(|event| !event.is_error_event()));
    assert_eq!(listener.session_count(), 0);

    listener.stop();
}

#[tokio::test]
async fn test_multicast_reaches_every_session() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let mut server_events = listener.subscribe();

    let first = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let second = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut first_events = first.subscribe();
    let mut second_events = second.subscribe();
    assert!(first.connect().await);
    assert!(second.connect().await);

    for _ in 0..2 {
        wait_for(&mut server_events, |event| matches!(event, ListenerEvent::SessionStarted(_))).await;
    }

    assert_eq!(listener.multicast(&b"hello"[..]), 2);
    assert_eq!(receive_exact(&mut first_events, 5).await, b"hello");
    assert_eq!(receive_exact(&mut second_events, 5).await, b"hello");

    listener.stop();
}

#[tokio::test]
async fn test_stop_races_with_session_disconnect() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let mut server_events = listener.subscribe();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(tokio::net::TcpStream::connect(addr).await.unwrap());
    }
    for _ in 0..3 {
        wait_for(&mut server_events, |event| matches!(event, ListenerEvent::SessionStarted(_))).await;
    }
    assert_eq!(listener.session_count(), 3);

    // One peer goes away while the listener shuts down
    let doomed = clients.pop().unwrap();
    let closer = tokio::spawn(async move { drop(doomed) });
    let stopper = {
        let listener = listener.clone();
        tokio::task::spawn_blocking(move || listener.stop())
    };
    closer.await.unwrap();
    assert!(stopper.await.unwrap());

    assert_eq!(listener.session_count(), 0);
    assert!(!listener.is_listening());

    let mut dropped = 0;
    tokio::time::timeout(WAIT, async {
        while dropped < 3 {
            if let ListenerEvent::SessionDropped { .. } = server_events.recv().await.unwrap() {
                dropped += 1;
            }
        }
    })
    .await
    .expect("not every session was dropped");

    // Late receive loops must not announce a session twice
    tokio::time::sleep(Duration::from_millis(100)).await;
    let extra = drain(&mut server_events)
        .into_iter()
        .filter(|event| matches!(event, ListenerEvent::SessionDropped { .. }))
        .count();
    assert_eq!(extra, 0);
}

#[tokio::test]
async fn test_session_send_reaches_client() {
    init_tracing();
    let (listener, addr) = start_listener(ListenerConfig::default()).await;
    let mut server_events = listener.subscribe();

    let client = Connection::tcp(addr, ConnectionConfig::default()).unwrap();
    let mut events = client.subscribe();
    assert!(client.connect().await);

    let started = wait_for(&mut server_events, |event| matches!(event, ListenerEvent::SessionStarted(_))).await;
    let ListenerEvent::SessionStarted(session) = started else {
        unreachable!()
    };
    let session: Arc<TcpSession> = session;

    assert_eq!(session.send(b"welcome").await.unwrap(), 7);
    assert_eq!(receive_exact(&mut events, 7).await, b"welcome");
    assert_eq!(session.stats().bytes_sent, 7);

    listener.stop();
    // Stopping the listener closes the session, which the client sees as EOF
    wait_for(&mut events, |event| matches!(event, ConnectionEvent::StatusChanged(false))).await;
    assert!(!client.is_connected());
}
