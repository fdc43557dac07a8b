//! Per-key entry listeners and connection-state listeners.
//!
//! Closures cannot be compared, so every registration returns a
//! [`ListenerId`] that is later used to remove it. Removing an unknown id is a
//! no-op.
//!
//! # Deadlock Prevention
//!
//! Callbacks are cloned out under the registry lock and invoked after the lock
//! is released, so a listener may register or remove listeners (or call back
//! into the table) without deadlocking.
//!
//! # Failure Isolation
//!
//! Each callback runs inside `catch_unwind`. A panicking listener is logged and
//! the remaining listeners still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::EntryCache;
use crate::codec::EntryValue;

/// Callback invoked with `(key, value)` on every inbound update for its key.
pub type EntryCallback = Arc<dyn Fn(&str, &EntryValue) + Send + Sync>;

/// Callback invoked with `true` on connect and `false` on disconnect.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lst_{}", self.0)
    }
}

#[derive(Default)]
struct Registrations {
    /// key -> callbacks in registration order.
    entry: HashMap<String, Vec<(ListenerId, EntryCallback)>>,
    connection: Vec<(ListenerId, ConnectionCallback)>,
    next_id: u64,
}

impl Registrations {
    fn next_id(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Registry of entry and connection listeners.
pub struct ListenerRegistry {
    cache: Arc<EntryCache>,
    inner: Mutex<Registrations>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ListenerRegistry")
            .field("entry_keys", &inner.entry.len())
            .field(
                "entry_listeners",
                &inner.entry.values().map(Vec::len).sum::<usize>(),
            )
            .field("connection_listeners", &inner.connection.len())
            .finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    /// Create an empty registry that reads current values from `cache`.
    #[must_use]
    pub fn new(cache: Arc<EntryCache>) -> Self {
        Self {
            cache,
            inner: Mutex::new(Registrations::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registrations> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for updates to `key`.
    ///
    /// With `immediate_notify`, if the cache already holds a value for `key`,
    /// the callback runs once with it before this method returns.
    pub fn add_entry_listener<F>(&self, key: &str, callback: F, immediate_notify: bool) -> ListenerId
    where
        F: Fn(&str, &EntryValue) + Send + Sync + 'static,
    {
        let callback: EntryCallback = Arc::new(callback);
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner
                .entry
                .entry(key.to_string())
                .or_default()
                .push((id, Arc::clone(&callback)));
            id
        };
        log::debug!("[Listeners] Registered entry listener {} for '{}'", id, key);

        if immediate_notify {
            if let Some(entry) = self.cache.get_entry(key) {
                invoke_entry(id, &callback, &entry.key, &entry.value);
            }
        }
        id
    }

    /// Remove an entry listener. Returns `false` if it was not registered.
    pub fn remove_entry_listener(&self, key: &str, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let Some(listeners) = inner.entry.get_mut(key) else {
            return false;
        };
        let Some(idx) = listeners.iter().position(|(lid, _)| *lid == id) else {
            return false;
        };
        listeners.remove(idx);
        if listeners.is_empty() {
            inner.entry.remove(key);
        }
        log::debug!("[Listeners] Removed entry listener {} for '{}'", id, key);
        true
    }

    /// Register a connection-state callback.
    pub fn add_connection_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.connection.push((id, Arc::new(callback)));
        id
    }

    /// Remove a connection listener. Returns `false` if it was not registered.
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.connection.len();
        inner.connection.retain(|(lid, _)| *lid != id);
        inner.connection.len() != before
    }

    /// Invoke every listener for `key`, in registration order.
    ///
    /// Returns how many listeners completed without panicking.
    pub fn notify_entry(&self, key: &str, value: &EntryValue) -> usize {
        let callbacks: Vec<(ListenerId, EntryCallback)> = {
            let inner = self.lock();
            inner.entry.get(key).cloned().unwrap_or_default()
        };

        let mut invoked = 0;
        for (id, cb) in &callbacks {
            if invoke_entry(*id, cb, key, value) {
                invoked += 1;
            }
        }
        invoked
    }

    /// Invoke every connection listener with `connected`.
    pub fn notify_connection(&self, connected: bool) -> usize {
        let callbacks: Vec<(ListenerId, ConnectionCallback)> = self.lock().connection.clone();

        let mut invoked = 0;
        for (id, cb) in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| cb(connected))) {
                Ok(()) => invoked += 1,
                Err(_) => log::warn!(
                    "[Listeners] Connection listener {} panicked (connected={})",
                    id,
                    connected
                ),
            }
        }
        invoked
    }

    /// Number of listeners registered for `key`.
    #[must_use]
    pub fn entry_listener_count(&self, key: &str) -> usize {
        self.lock().entry.get(key).map_or(0, Vec::len)
    }

    /// Number of connection listeners.
    #[must_use]
    pub fn connection_listener_count(&self) -> usize {
        self.lock().connection.len()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entry.clear();
        inner.connection.clear();
    }
}

fn invoke_entry(id: ListenerId, callback: &EntryCallback, key: &str, value: &EntryValue) -> bool {
    if catch_unwind(AssertUnwindSafe(|| callback(key, value))).is_ok() {
        true
    } else {
        log::warn!("[Listeners] Entry listener {} for '{}' panicked", id, key);
        false
    }
}
