//! Durable accumulation buffer.
//!
//! A single SQLite table maps topic → concatenated payload. Producers append
//! samples as they stream in; a poller later drains a topic with an atomic
//! read-and-clear, so no sample is ever returned twice or lost between the
//! read and the delete.
//!
//! ```sql
//! CREATE TABLE buffer (
//!     key        TEXT PRIMARY KEY,
//!     value      TEXT NOT NULL,
//!     updated_at INTEGER NOT NULL   -- ms since epoch of the last append
//! )
//! ```
//!
//! Appends use an upsert that concatenates in SQL, so concurrent appenders
//! never lose a sample to a read-modify-write race. There is no size cap:
//! an undrained topic grows until SQLite's own string limit rejects the
//! append with a storage error.

// Rust guideline compliant 2026-02

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::RelayError;

/// A drained buffer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRecord {
    /// Topic key.
    pub key: String,
    /// Every payload appended since the last drain, in append order.
    pub accumulated: String,
    /// Time of the last append.
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed topic → accumulated payload store.
#[derive(Debug)]
pub struct AccumulationBuffer {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl AccumulationBuffer {
    /// Open (or create) the buffer at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] if the directory or database cannot be created.
    pub fn open(path: &Path) -> Result<Self, RelayError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        log::debug!("[Buffer] Opened {} (journal_mode={})", path.display(), mode);

        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Buffer that lives only as long as this value.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] if SQLite cannot create the table.
    pub fn open_in_memory() -> Result<Self, RelayError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, RelayError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buffer (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the connection so other callers block.
    #[cfg(test)]
    pub(crate) fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    /// Database file, or `None` for an in-memory buffer.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `data` to whatever is accumulated under `key`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure.
    pub fn append(&self, key: &str, data: &str) -> Result<(), RelayError> {
        let now = Utc::now().timestamp_millis();
        self.conn().execute(
            "INSERT INTO buffer (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = value || excluded.value,
                updated_at = excluded.updated_at",
            params![key, data, now],
        )?;
        log::trace!("[Buffer] Appended {} byte(s) to '{}'", data.len(), key);
        Ok(())
    }

    /// Atomically read and delete the record for `key`.
    ///
    /// Returns `None` if nothing has been appended since the last drain.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure; the record is left in place.
    pub fn take(&self, key: &str) -> Result<Option<BufferRecord>, RelayError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT value, updated_at FROM buffer WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((accumulated, updated_ms)) = row else {
            return Ok(None);
        };

        tx.execute("DELETE FROM buffer WHERE key = ?1", params![key])?;
        tx.commit()?;

        log::debug!("[Buffer] Drained {} byte(s) from '{}'", accumulated.len(), key);
        Ok(Some(BufferRecord {
            key: key.to_string(),
            accumulated,
            updated_at: Utc
                .timestamp_millis_opt(updated_ms)
                .single()
                .unwrap_or_default(),
        }))
    }

    /// [`Self::take`], returning only the accumulated payload.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure.
    pub fn read_and_clear(&self, key: &str) -> Result<Option<String>, RelayError> {
        Ok(self.take(key)?.map(|record| record.accumulated))
    }

    /// Delete every record. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure.
    pub fn clear_all(&self) -> Result<usize, RelayError> {
        let removed = self.conn().execute("DELETE FROM buffer", [])?;
        log::info!("[Buffer] Cleared {} record(s)", removed);
        Ok(removed)
    }

    /// Number of topics with pending data.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure.
    pub fn len(&self) -> Result<usize, RelayError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM buffer", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// `true` if no topic has pending data.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure.
    pub fn is_empty(&self) -> Result<bool, RelayError> {
        Ok(self.len()? == 0)
    }

    /// Topics with pending data, ordered.
    ///
    /// # Errors
    ///
    /// [`RelayError::Storage`] on any SQLite failure.
    pub fn keys(&self) -> Result<Vec<String>, RelayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM buffer ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}
