//! Connection manager for the single peer socket.
//!
//! Owns the socket lifecycle and the outbound write path. Retries are NOT
//! scheduled here; the [`Supervisor`](crate::supervisor::Supervisor) calls
//! [`ConnectionManager::connect`] while the state is `Disconnected`.
//!
//! # State machine
//!
//! ```text
//!   Disconnected ──connect()──► Connecting ──socket open──► Connected
//!        ▲                          │                           │
//!        └────── connect failure ───┘                           │
//!        └──────────── error / close / disconnect() ────────────┘
//! ```
//!
//! The `Disconnected → Connecting` step is a compare-and-set under the state
//! mutex, so at most one attempt is ever in flight.
//!
//! # Session task
//!
//! Each open socket is driven by one spawned task that fires the `true`
//! connection notification, reads frames (decode → cache → listeners, or
//! bridge events → event sink), writes queued outbound frames, and on exit
//! returns the state to `Disconnected`, fires `false`, then raises its `done`
//! signal. Every `disconnect` caller waits on that signal.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::cache::{Entry, EntryCache};
use crate::codec::{self, BridgeEvent, EntryUpdate, InboundFrame};
use crate::error::RelayError;
use crate::listeners::ListenerRegistry;
use crate::ws::{Connector, FrameSink, FrameSource, PeerAddress, WsMessage};

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection state of the peer socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket and no attempt in flight.
    #[default]
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// Socket open.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Result of a [`ConnectionManager::connect`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new socket was opened.
    Connected,
    /// Nothing done: an attempt was already in flight or a socket is open.
    AlreadyActive,
}

/// Identity of a connected peer (`host:port`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, serde::Serialize)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&PeerAddress> for PeerId {
    fn from(peer: &PeerAddress) -> Self {
        Self(peer.to_string())
    }
}

/// Receiver for inbound bridge events (`{topic_name, data}` frames).
pub trait EventSink: Send + Sync {
    /// Handle one event. Failures are the sink's to log; the session keeps running.
    fn on_event(&self, event: &BridgeEvent);
}

/// Queued outbound frame with its write acknowledgement.
struct Outbound {
    text: String,
    ack: oneshot::Sender<Result<(), String>>,
}

/// Handles to the running session task.
struct SessionHandle {
    epoch: u64,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    /// Flips to `true` once the task has run its teardown.
    done: watch::Receiver<bool>,
}

/// State shared between the manager and its session task.
struct Shared {
    peer: PeerAddress,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<SessionHandle>>,
    cache: Arc<EntryCache>,
    listeners: Arc<ListenerRegistry>,
    event_sink: Option<Arc<dyn EventSink>>,
    closed: AtomicBool,
    next_epoch: AtomicU64,
    /// Held while connection listeners run, so `true`/`false` never interleave.
    transition: Mutex<()>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state();
        if *state != next {
            log::debug!("[Connection] State {} -> {}", *state, next);
            *state = next;
        }
    }

    /// `Disconnected → Connecting`, atomically. `false` if in any other state.
    fn begin_connecting(&self) -> bool {
        let mut state = self.state();
        if *state == ConnectionState::Disconnected {
            *state = ConnectionState::Connecting;
            log::debug!("[Connection] State disconnected -> connecting");
            true
        } else {
            false
        }
    }

    /// Decode and route one inbound text frame. Bad frames are dropped.
    fn dispatch(&self, text: &str) {
        match codec::decode_frame(text) {
            Ok(InboundFrame::Entry(update)) => {
                log::trace!("[Connection] Entry update for '{}'", update.key);
                self.cache.insert(&update.key, update.value.clone());
                self.listeners.notify_entry(&update.key, &update.value);
            }
            Ok(InboundFrame::Event(event)) => match &self.event_sink {
                Some(sink) => sink.on_event(&event),
                None => log::trace!(
                    "[Connection] No event sink, dropping event for '{}'",
                    event.topic_name
                ),
            },
            Err(e) => log::warn!("[Connection] Dropping frame: {} ({})", e, preview(text)),
        }
    }

    /// Fire connection listeners with `connected`, one transition at a time.
    fn announce(&self, connected: bool) {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.listeners.notify_connection(connected);
    }

    /// Tear-down path of a session task.
    ///
    /// The state is `Disconnected` before listeners see `false`. The session
    /// stays in the slot until a `disconnect` collects it, so callers arriving
    /// mid-teardown still find the `done` signal and wait on it.
    fn finish_session(&self, reason: &str) {
        log::info!("[Connection] Disconnected from {} ({})", self.peer, reason);
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.set_state(ConnectionState::Disconnected);
        self.listeners.notify_connection(false);
    }
}

/// Owns the peer socket and its state machine.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for `peer` that opens sockets through `connector`.
    ///
    /// Inbound entry updates are written to `cache` and announced on `listeners`.
    pub fn new(
        peer: PeerAddress,
        connector: Arc<dyn Connector>,
        cache: Arc<EntryCache>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self::build(peer, connector, cache, listeners, None)
    }

    /// Same as [`Self::new`], with bridge events forwarded to `sink`.
    pub fn with_event_sink(
        peer: PeerAddress,
        connector: Arc<dyn Connector>,
        cache: Arc<EntryCache>,
        listeners: Arc<ListenerRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::build(peer, connector, cache, listeners, Some(sink))
    }

    fn build(
        peer: PeerAddress,
        connector: Arc<dyn Connector>,
        cache: Arc<EntryCache>,
        listeners: Arc<ListenerRegistry>,
        event_sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                cache,
                listeners,
                event_sink,
                closed: AtomicBool::new(false),
                next_epoch: AtomicU64::new(0),
                transition: Mutex::new(()),
            }),
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound each connect attempt by `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state()
    }

    /// `true` while a socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Peer this manager connects to.
    #[must_use]
    pub fn peer(&self) -> &PeerAddress {
        &self.shared.peer
    }

    /// Cache inbound updates are written to.
    #[must_use]
    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.shared.cache
    }

    /// Registry inbound updates and state changes are announced on.
    #[must_use]
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.shared.listeners
    }

    /// Peers with an open socket: the configured peer while `Connected`, else empty.
    #[must_use]
    pub fn get_connections(&self) -> Vec<PeerId> {
        if self.is_connected() {
            vec![PeerId::from(&self.shared.peer)]
        } else {
            Vec::new()
        }
    }

    /// Open the socket if (and only if) the state is `Disconnected`.
    ///
    /// Returns [`ConnectOutcome::AlreadyActive`] without doing anything when
    /// an attempt is in flight or a socket is open. On success the connection
    /// listeners have been invoked with `true` by the time this returns.
    ///
    /// # Errors
    ///
    /// - [`RelayError::ConnectFailed`] if the socket could not be opened within
    ///   the connect timeout; the state is back to `Disconnected`.
    /// - [`RelayError::Closed`] after [`Self::shutdown`].
    pub async fn connect(&self) -> Result<ConnectOutcome, RelayError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        if !self.shared.begin_connecting() {
            return Ok(ConnectOutcome::AlreadyActive);
        }

        // Dropping this future mid-attempt must not leave us stuck in Connecting
        let attempt = scopeguard::guard(Arc::clone(&self.shared), |shared| {
            shared.set_state(ConnectionState::Disconnected);
        });

        let peer = &self.shared.peer;
        log::info!("[Connection] Connecting to {}", peer.url());

        let transport = match tokio::time::timeout(self.connect_timeout, self.connector.connect(peer)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                log::warn!("[Connection] Connection to {} failed: {:#}", peer, e);
                return Err(RelayError::ConnectFailed(format!("{e:#}")));
            }
            Err(_elapsed) => {
                log::warn!(
                    "[Connection] Connection to {} timed out after {:?}",
                    peer,
                    self.connect_timeout
                );
                return Err(RelayError::ConnectFailed(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        };
        let (mut writer, reader) = transport;

        let (started_tx, started_rx) = oneshot::channel();
        {
            let mut slot = self.shared.session();
            if self.shared.closed.load(Ordering::SeqCst) {
                drop(slot);
                let _ = writer.close().await;
                return Err(RelayError::Closed);
            }

            let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let (done_tx, done) = watch::channel(false);

            // Connected before the task exists, so its exit path always wins
            scopeguard::ScopeGuard::into_inner(attempt).set_state(ConnectionState::Connected);

            tokio::spawn(run_session(
                Arc::clone(&self.shared),
                writer,
                reader,
                outbound_rx,
                cancel.clone(),
                started_tx,
                done_tx,
            ));
            *slot = Some(SessionHandle {
                epoch,
                outbound_tx,
                cancel,
                done,
            });
        }

        log::info!("[Connection] Connected to {}", peer);
        let _ = started_rx.await;
        Ok(ConnectOutcome::Connected)
    }

    /// Encode and write `update`, then record it in the cache.
    ///
    /// Local readers see the new value without waiting for the peer to echo it.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotConnected`] unless the state is `Connected`, or if
    ///   the socket closed before the frame was written.
    /// - [`RelayError::SendFailed`] if the socket write failed.
    pub async fn send(&self, update: EntryUpdate) -> Result<Entry, RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let text = codec::encode_entry(&update)?;

        let outbound_tx = self
            .shared
            .session()
            .as_ref()
            .map(|s| s.outbound_tx.clone())
            .ok_or(RelayError::NotConnected)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound_tx.send(Outbound { text, ack: ack_tx }).is_err() {
            return Err(RelayError::NotConnected);
        }
        match ack_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => return Err(RelayError::SendFailed(msg)),
            Err(_dropped) => return Err(RelayError::NotConnected),
        }

        Ok(self.shared.cache.insert(&update.key, update.value))
    }

    /// Close the open socket, if any, and wait for its session to finish.
    ///
    /// Listeners have seen `false` by the time this returns, also when several
    /// callers race. Idempotent.
    pub async fn disconnect(&self) {
        let (epoch, cancel, mut done) = {
            let slot = self.shared.session();
            match slot.as_ref() {
                Some(session) => (session.epoch, session.cancel.clone(), session.done.clone()),
                None => return,
            }
        };

        cancel.cancel();
        if done.wait_for(|finished| *finished).await.is_err() {
            log::error!("[Connection] Session task ended without teardown");
        }

        let mut slot = self.shared.session();
        if slot.as_ref().is_some_and(|s| s.epoch == epoch) {
            *slot = None;
        }
    }

    /// Disconnect and refuse every later [`Self::connect`].
    ///
    /// Once this returns no listener will be invoked by this manager again.
    pub async fn shutdown(&self) {
        {
            let _slot = self.shared.session();
            self.shared.closed.store(true, Ordering::SeqCst);
        }
        log::info!("[Connection] Shutting down");
        self.disconnect().await;
    }

    /// `true` after [`Self::shutdown`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Drive one open socket until it closes, errors, or is cancelled.
async fn run_session(
    shared: Arc<Shared>,
    mut writer: Box<dyn FrameSink>,
    mut reader: Box<dyn FrameSource>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    started_tx: oneshot::Sender<()>,
    done_tx: watch::Sender<bool>,
) {
    shared.announce(true);
    let _ = started_tx.send(());

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = writer.close().await {
                    log::debug!("[Connection] Close failed: {:#}", e);
                }
                break "closed locally".to_string();
            }

            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => shared.dispatch(&text),
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => shared.dispatch(&text),
                    Err(_) => log::warn!("[Connection] Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        break format!("pong failed: {e:#}");
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    break format!("closed by peer: {code} {reason}");
                }
                Some(Err(e)) => break format!("socket error: {e:#}"),
                None => break "stream ended".to_string(),
            },

            Some(out) = outbound_rx.recv() => {
                let result = writer.send_text(&out.text).await.map_err(|e| format!("{e:#}"));
                let failure = result.as_ref().err().cloned();
                let _ = out.ack.send(result);
                if let Some(msg) = failure {
                    break format!("write failed: {msg}");
                }
            }
        }
    };

    drop(outbound_rx);
    shared.finish_session(&reason);
    done_tx.send_replace(true);
}

/// First 100 characters of a frame, for logs.
fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EntryValue;
    use crate::test_support::{wait_until, MockConnector};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager(connector: &Arc<MockConnector>) -> ConnectionManager {
        let cache = Arc::new(EntryCache::new());
        let listeners = Arc::new(ListenerRegistry::new(Arc::clone(&cache)));
        ConnectionManager::new(
            PeerAddress::new("127.0.0.1", 5810, "/nt/1"),
            Arc::clone(connector) as Arc<dyn Connector>,
            cache,
            listeners,
        )
    }

    #[tokio::test]
    async fn test_connect_transitions_and_notifies() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager
            .listeners()
            .add_connection_listener(move |c| sink.lock().unwrap().push(c));

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.get_connections().is_empty());

        assert_eq!(manager.connect().await.unwrap(), ConnectOutcome::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(
            manager.get_connections(),
            vec![PeerId("127.0.0.1:5810".into())]
        );
    }

    #[tokio::test]
    async fn test_connect_is_noop_while_connected() {
        let connector = MockConnector::new();
        let manager = manager(&connector);

        manager.connect().await.unwrap();
        assert_eq!(manager.connect().await.unwrap(), ConnectOutcome::AlreadyActive);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_noop_while_connecting() {
        let connector = MockConnector::new();
        let gate = connector.hold_connects();
        let manager = Arc::new(manager(&connector));

        let first = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.connect().await }
        });
        connector.wait_for_attempts(1).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert_eq!(manager.connect().await.unwrap(), ConnectOutcome::AlreadyActive);
        assert_eq!(connector.attempts(), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), ConnectOutcome::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let connector = MockConnector::new();
        connector.set_failing(true);
        let manager = manager(&connector);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectFailed(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let connector = MockConnector::new();
        let _gate = connector.hold_connects();
        let manager = manager(&connector).connect_timeout(Duration::from_millis(500));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectFailed(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_socket_error_disconnects_and_notifies() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager
            .listeners()
            .add_connection_listener(move |c| sink.lock().unwrap().push(c));

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        peer.fail("connection reset");

        wait_until(|| manager.state() == ConnectionState::Disconnected).await;
        assert!(manager.get_connections().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);

        // A fresh attempt is allowed again
        assert_eq!(manager.connect().await.unwrap(), ConnectOutcome::Connected);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_inbound_entry_updates_cache_and_listeners() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        manager.listeners().add_entry_listener(
            "motor_speed",
            move |k, v| sink.lock().unwrap().push((k.to_string(), v.clone())),
            false,
        );

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        peer.push_text(r#"{"type":"entry","key":"motor_speed","value":0.42}"#);
        peer.push_text(r#"{"type":"entry","key":"other","value":"x"}"#);

        wait_until(|| manager.cache().get_entry("other").is_some()).await;

        let entry = manager.cache().get_entry("motor_speed").unwrap();
        assert_eq!(entry.value, EntryValue::Number(0.42));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("motor_speed".to_string(), EntryValue::Number(0.42))]
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let connector = MockConnector::new();
        let manager = manager(&connector);

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        peer.push_text("{garbage");
        peer.push_binary(vec![0xff, 0xfe]);
        peer.push_text(r#"{"key":"after","value":true}"#);

        wait_until(|| manager.cache().get_entry("after").is_some()).await;
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_bridge_events_reach_event_sink() {
        struct Collect(Mutex<Vec<BridgeEvent>>);
        impl EventSink for Collect {
            fn on_event(&self, event: &BridgeEvent) {
                self.0.lock().unwrap().push(event.clone());
            }
        }

        let connector = MockConnector::new();
        let cache = Arc::new(EntryCache::new());
        let listeners = Arc::new(ListenerRegistry::new(Arc::clone(&cache)));
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let manager = ConnectionManager::with_event_sink(
            PeerAddress::new("127.0.0.1", 5810, "/"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            cache,
            listeners,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        peer.push_text(&json!({"topic_name": "/drive", "data": "1,"}).to_string());

        wait_until(|| !sink.0.lock().unwrap().is_empty()).await;
        assert_eq!(
            sink.0.lock().unwrap()[0],
            BridgeEvent {
                topic_name: "/drive".into(),
                data: "1,".into()
            }
        );
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let connector = MockConnector::new();
        let manager = manager(&connector);

        let err = manager.send(EntryUpdate::new("k", 1.0)).await.unwrap_err();
        assert_eq!(err, RelayError::NotConnected);
        assert!(manager.cache().get_entry("k").is_none());
    }

    #[tokio::test]
    async fn test_send_writes_frame_and_updates_cache() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        let mut peer = connector.take_peer().await;

        let entry = manager.send(EntryUpdate::new("enabled", true)).await.unwrap();
        assert_eq!(entry.value, EntryValue::Boolean(true));

        let frame: serde_json::Value =
            serde_json::from_str(&peer.next_sent().await.unwrap()).unwrap();
        assert_eq!(frame, json!({"key": "enabled", "value": true, "type": "boolean"}));
        assert_eq!(manager.cache().get_entry("enabled").unwrap(), entry);
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        peer.break_writes();

        let err = manager.send(EntryUpdate::new("k", 1.0)).await.unwrap_err();
        assert!(matches!(err, RelayError::SendFailed(_)));
        assert!(manager.cache().get_entry("k").is_none());
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        let mut peer = connector.take_peer().await;

        peer.push(WsMessage::Ping(vec![1, 2, 3]));
        assert_eq!(peer.next_pong().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let falses = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&falses);
        manager.listeners().add_connection_listener(move |c| {
            if !c {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(peer.was_closed());
        assert_eq!(falses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_connect_and_silences_listeners() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.listeners().add_entry_listener(
            "k",
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        manager.shutdown().await;

        assert!(manager.is_closed());
        assert_eq!(manager.connect().await.unwrap_err(), RelayError::Closed);

        // Frames arriving after shutdown go nowhere
        peer.push_text(r#"{"key":"k","value":1}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_disconnect_and_shutdown_both_wait() {
        let connector = MockConnector::new();
        connector.slow_close(Duration::from_millis(200));
        let manager = Arc::new(manager(&connector));
        let falses = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&falses);
        manager.listeners().add_connection_listener(move |c| {
            if !c {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        manager.connect().await.unwrap();
        let _peer = connector.take_peer().await;

        let first = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.disconnect().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(falses.load(Ordering::SeqCst), 1);

        first.await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(falses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_false_listener_sees_disconnected_state() {
        let connector = MockConnector::new();
        let manager = Arc::new(manager(&connector));
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let weak = Arc::downgrade(&manager);
        manager.listeners().add_connection_listener(move |c| {
            if let (false, Some(m)) = (c, weak.upgrade()) {
                *sink.lock().unwrap() = Some((m.state(), m.get_connections().len()));
            }
        });

        manager.connect().await.unwrap();
        let peer = connector.take_peer().await;
        peer.fail("connection reset");

        wait_until(|| observed.lock().unwrap().is_some()).await;
        assert_eq!(
            *observed.lock().unwrap(),
            Some((ConnectionState::Disconnected, 0))
        );
    }
}
