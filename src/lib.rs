//! nt-relay - NetworkTables telemetry relay.
//!
//! Keeps one WebSocket connection to a robot-side NetworkTables peer, mirrors
//! every entry it publishes into a local cache, fans updates out to
//! listeners, and accumulates streamed samples in a durable buffer that
//! pollers drain over HTTP.
//!
//! # Architecture
//!
//! - **ConnectionManager** - Owns the socket and its state machine
//! - **Supervisor** - Reconnect loop driven by a [`RetryPolicy`]
//! - **NetworkTable** - Client facade: reads, writes, subscriptions
//! - **AccumulationBuffer** - SQLite topic → payload store with read-and-clear
//! - **Bridge** - Wires all of the above for the daemon
//! - **Server** - actix-web routes over the table and buffer
//!
//! # Modules
//!
//! - [`codec`] - Wire frames and value types
//! - [`cache`] - Latest value per key
//! - [`listeners`] - Entry and connection callbacks
//! - [`ws`] - WebSocket transport and the `Connector` seam
//! - [`config`] - Defaults, JSON file, `NT_RELAY_*` overrides

// Library modules
pub mod bridge;
pub mod buffer;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod server;
pub mod supervisor;
pub mod table;
pub mod ws;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use bridge::{Bridge, BufferWriter};
pub use buffer::{AccumulationBuffer, BufferRecord};
pub use cache::{Entry, EntryCache};
pub use codec::{BridgeEvent, EntryUpdate, EntryValue, ValueType};
pub use config::Config;
pub use connection::{ConnectOutcome, ConnectionManager, ConnectionState, EventSink, PeerId};
pub use error::RelayError;
pub use listeners::{ListenerId, ListenerRegistry};
pub use supervisor::{Backoff, RetryPolicy, Supervisor};
pub use table::NetworkTable;
pub use ws::{Connector, PeerAddress, WsConnector};
