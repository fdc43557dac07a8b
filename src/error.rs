//! Error kinds surfaced by the relay.
//!
//! Absence is not an error here: cache and buffer lookups return `Option`,
//! so `None` is the normal "not found" answer.

/// Errors that can occur during relay operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// `send`/`set_value` attempted while the peer connection is not `Connected`.
    NotConnected,
    /// An inbound frame could not be decoded.
    Decode(String),
    /// The durable buffer failed to read or write.
    Storage(String),
    /// The socket to the peer could not be established.
    ConnectFailed(String),
    /// The frame was accepted but the socket write failed.
    SendFailed(String),
    /// The connection manager has been shut down.
    Closed,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected to peer"),
            Self::Decode(msg) => write!(f, "Decode error: {msg}"),
            Self::Storage(msg) => write!(f, "Storage error: {msg}"),
            Self::ConnectFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Closed => write!(f, "Connection manager closed"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
