//! In-memory transport for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::ws::{Connector, FrameSink, FrameSource, PeerAddress, Transport, WsMessage};

/// Poll `cond` until it holds, failing the test after ~5s.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Connector that hands out channel-backed sockets.
pub(crate) struct MockConnector {
    attempts: AtomicUsize,
    failing: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    close_delay: Mutex<Duration>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            gate: Mutex::new(None),
            close_delay: Mutex::new(Duration::ZERO),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        })
    }

    /// Number of `connect` calls so far.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make every later attempt fail (or succeed again).
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Park every later attempt until the returned gate is notified.
    pub(crate) fn hold_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Make `close()` on later sockets take `delay`.
    pub(crate) fn slow_close(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    pub(crate) async fn wait_for_attempts(&self, n: usize) {
        wait_until(|| self.attempts() >= n).await;
    }

    /// Peer end of the next socket opened.
    pub(crate) async fn take_peer(&self) -> MockPeer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _peer: &PeerAddress) -> Result<Transport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let broken = Arc::new(AtomicBool::new(false));

        let _ = self.peers_tx.send(MockPeer {
            inbound_tx,
            text_rx,
            pong_rx,
            closed: Arc::clone(&closed),
            broken: Arc::clone(&broken),
        });

        let sink = MockSink {
            text_tx,
            pong_tx,
            closed,
            broken,
            close_delay: *self.close_delay.lock().unwrap(),
        };
        let source = MockSource { inbound_rx };
        Ok((Box::new(sink), Box::new(source)))
    }
}

/// Test-side end of a mock socket. Dropping it ends the stream.
pub(crate) struct MockPeer {
    inbound_tx: mpsc::UnboundedSender<Result<WsMessage>>,
    text_rx: mpsc::UnboundedReceiver<String>,
    pong_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
}

impl MockPeer {
    pub(crate) fn push(&self, msg: WsMessage) {
        let _ = self.inbound_tx.send(Ok(msg));
    }

    pub(crate) fn push_text(&self, text: &str) {
        self.push(WsMessage::Text(text.to_string()));
    }

    pub(crate) fn push_binary(&self, data: Vec<u8>) {
        self.push(WsMessage::Binary(data));
    }

    /// Deliver a read error to the session.
    pub(crate) fn fail(&self, msg: &str) {
        let _ = self.inbound_tx.send(Err(anyhow::anyhow!(msg.to_string())));
    }

    /// Make later writes on this socket fail.
    pub(crate) fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_sent(&mut self) -> Option<String> {
        self.text_rx.recv().await
    }

    pub(crate) async fn next_pong(&mut self) -> Option<Vec<u8>> {
        self.pong_rx.recv().await
    }
}

struct MockSink {
    text_tx: mpsc::UnboundedSender<String>,
    pong_tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
    close_delay: Duration,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("broken pipe");
        }
        let _ = self.text_tx.send(text.to_string());
        Ok(())
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        let _ = self.pong_tx.send(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        tokio::time::sleep(self.close_delay).await;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSource {
    inbound_rx: mpsc::UnboundedReceiver<Result<WsMessage>>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        self.inbound_rx.recv().await
    }
}
