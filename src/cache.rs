//! Local cache of the most recent value per key.
//!
//! Reads never touch the network: the cache reflects whatever was last
//! received from the peer or last sent by a local `set_value`.
//!
//! # Thread Safety
//!
//! - `RwLock` for interior mutability; many readers, one writer at a time
//! - A poisoned lock is recovered rather than propagated, since every write
//!   is a single `insert` and cannot leave a half-updated map behind

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{EntryValue, ValueType};

/// The cached current value for a key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    /// Table key.
    pub key: String,
    /// Most recent value.
    pub value: EntryValue,
    /// Tag of `value`.
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// When this key was last written.
    pub last_updated: DateTime<Utc>,
}

/// Key → [`Entry`] map shared by the connection task and local callers.
#[derive(Debug, Default)]
pub struct EntryCache {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl EntryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `key`, or `None` if nothing was ever cached for it.
    #[must_use]
    pub fn get_entry(&self, key: &str) -> Option<Entry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Every cached entry whose key starts with `prefix`, ordered by key.
    ///
    /// An empty prefix returns the whole cache.
    #[must_use]
    pub fn get_entries(&self, prefix: &str) -> Vec<Entry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Insert or overwrite the entry for `key`, stamping it with the current time.
    ///
    /// Returns the stored entry.
    pub fn insert(&self, key: &str, value: EntryValue) -> Entry {
        let entry = Entry {
            key: key.to_string(),
            value_type: value.value_type(),
            value,
            last_updated: Utc::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry.clone());
        entry
    }

    /// Cached keys, ordered.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
