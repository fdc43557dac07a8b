//! WebSocket transport to the peer.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, plus the [`Connector`] seam the connection manager
//! opens sockets through. Production uses [`WsConnector`]; tests substitute
//! an in-memory connector.
//!
//! ```text
//!   ConnectionManager ──connect()──► Connector ──► (FrameSink, FrameSource)
//!                                       │
//!                                  WsConnector ──► tokio_tungstenite::connect_async
//! ```

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Where the peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Request path, e.g. `/nt/1`.
    pub path: String,
}

impl PeerAddress {
    /// Build an address; a missing leading `/` on `path` is added.
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Self {
            host: host.into(),
            port,
            path,
        }
    }

    /// WebSocket URL for this peer.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Received WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Outbound half of a peer socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Answer a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Send a close frame and flush.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a peer socket.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next message, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// Writer/reader pair for one open socket.
pub type Transport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Socket factory used by the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `peer`.
    async fn connect(&self, peer: &PeerAddress) -> Result<Transport>;
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    async fn close(&mut self) -> Result<()> {
        // Peer may already be gone; a failed close frame is not interesting
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data)));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data)));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map_or((1005, String::new()), |cf| {
                            (cf.code.into(), cf.reason.to_string())
                        });
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {}
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Open a WebSocket to `url`, giving up after `timeout`.
///
/// # Errors
///
/// Returns an error if the URL is invalid, the handshake fails, or the
/// timeout elapses first.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .with_context(|| format!("WebSocket connect to {url} timed out after {timeout:?}"))?
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// [`Connector`] backed by real WebSocket sockets.
#[derive(Debug, Clone)]
pub struct WsConnector {
    timeout: Duration,
}

impl WsConnector {
    /// Connector whose handshakes give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, peer: &PeerAddress) -> Result<Transport> {
        let (writer, reader) = connect(&peer.url(), self.timeout).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_url() {
        let peer = PeerAddress::new("10.0.0.2", 5810, "/nt/1");
        assert_eq!(peer.url(), "ws://10.0.0.2:5810/nt/1");
        assert_eq!(peer.to_string(), "10.0.0.2:5810");
    }

    #[test]
    fn test_peer_path_gets_leading_slash() {
        let peer = PeerAddress::new("localhost", 8000, "nt/1");
        assert_eq!(peer.path, "/nt/1");

        let root = PeerAddress::new("localhost", 8000, "");
        assert_eq!(root.url(), "ws://localhost:8000/");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/nt/1", Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ws_connector_reports_failure() {
        let connector = WsConnector::new(Duration::from_secs(2));
        let peer = PeerAddress::new("127.0.0.1", 1, "/");
        assert!(connector.connect(&peer).await.is_err());
    }
}
