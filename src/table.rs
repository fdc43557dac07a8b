//! Table facade: the public client surface.
//!
//! [`NetworkTable`] ties together the cache, listener registry and
//! connection manager so callers have one handle for reads, writes and
//! subscriptions. It is cheap to share behind an `Arc`; an optional
//! process-wide default instance is available through
//! [`NetworkTable::install_default`].

// Rust guideline compliant 2026-02

use std::sync::{Arc, OnceLock};

use crate::cache::{Entry, EntryCache};
use crate::codec::{EntryUpdate, EntryValue};
use crate::connection::{ConnectOutcome, ConnectionManager, PeerId};
use crate::error::RelayError;
use crate::listeners::{ListenerId, ListenerRegistry};

static DEFAULT_TABLE: OnceLock<Arc<NetworkTable>> = OnceLock::new();

/// Client handle over one peer connection.
#[derive(Debug, Clone)]
pub struct NetworkTable {
    connection: Arc<ConnectionManager>,
}

impl NetworkTable {
    /// Wrap an existing connection manager.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Connection manager behind this table.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Entry cache behind this table.
    #[must_use]
    pub fn cache(&self) -> &Arc<EntryCache> {
        self.connection.cache()
    }

    fn listeners(&self) -> &Arc<ListenerRegistry> {
        self.connection.listeners()
    }

    /// Cached entry for `key`. Never touches the network.
    #[must_use]
    pub fn get_entry(&self, key: &str) -> Option<Entry> {
        self.cache().get_entry(key)
    }

    /// Cached entries whose key starts with `prefix`.
    #[must_use]
    pub fn get_entries(&self, prefix: &str) -> Vec<Entry> {
        self.cache().get_entries(prefix)
    }

    /// Send `value` for `key` to the peer and cache it locally.
    ///
    /// # Errors
    ///
    /// [`RelayError::NotConnected`] when no socket is open; nothing is sent
    /// or cached in that case.
    pub async fn set_value(&self, key: &str, value: impl Into<EntryValue>) -> Result<Entry, RelayError> {
        self.connection.send(EntryUpdate::new(key, value)).await
    }

    /// Register `callback` for inbound updates to `key`.
    ///
    /// With `immediate_notify`, a cached value is delivered once right away.
    pub fn add_entry_listener<F>(&self, key: &str, callback: F, immediate_notify: bool) -> ListenerId
    where
        F: Fn(&str, &EntryValue) + Send + Sync + 'static,
    {
        self.listeners().add_entry_listener(key, callback, immediate_notify)
    }

    /// Unregister an entry listener. `false` if it was not registered.
    pub fn remove_entry_listener(&self, key: &str, id: ListenerId) -> bool {
        self.listeners().remove_entry_listener(key, id)
    }

    /// Register `callback` for connection state changes.
    pub fn add_connection_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.listeners().add_connection_listener(callback)
    }

    /// Unregister a connection listener. `false` if it was not registered.
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove_connection_listener(id)
    }

    /// Peers with an open socket.
    #[must_use]
    pub fn get_connections(&self) -> Vec<PeerId> {
        self.connection.get_connections()
    }

    /// `true` while the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// One connect attempt; see [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<ConnectOutcome, RelayError> {
        self.connection.connect().await
    }

    /// Close the socket; see [`ConnectionManager::disconnect`].
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Make `table` the process-wide default. `false` if one is already installed.
    pub fn install_default(table: Arc<Self>) -> bool {
        DEFAULT_TABLE.set(table).is_ok()
    }

    /// The process-wide default table, if installed.
    #[must_use]
    pub fn default_instance() -> Option<Arc<Self>> {
        DEFAULT_TABLE.get().cloned()
    }
}
