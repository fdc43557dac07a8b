//! Relay bridge: wires the peer connection to the accumulation buffer.
//!
//! ```text
//!   peer ──ws──► ConnectionManager ─┬─ entry  ──► EntryCache + listeners
//!                     ▲             └─ event  ──► AccumulationBuffer.append
//!                     │
//!                 Supervisor (reconnect loop)
//! ```
//!
//! Events are handed to a [`BufferWriter`], whose single blocking thread
//! performs the SQLite appends in arrival order. The session task only
//! enqueues, so a slow disk never stalls frame reads or pings.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buffer::AccumulationBuffer;
use crate::cache::EntryCache;
use crate::codec::BridgeEvent;
use crate::config::Config;
use crate::connection::{ConnectionManager, EventSink};
use crate::listeners::ListenerRegistry;
use crate::supervisor::{RetryPolicy, Supervisor};
use crate::table::NetworkTable;
use crate::ws::{Connector, PeerAddress, WsConnector};

/// Queue in front of an [`AccumulationBuffer`], drained by one blocking thread.
#[derive(Debug)]
pub struct BufferWriter {
    events_tx: Mutex<Option<mpsc::UnboundedSender<BridgeEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferWriter {
    /// Start the writer thread. Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(buffer: Arc<AccumulationBuffer>) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<BridgeEvent>();
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(event) = events_rx.blocking_recv() {
                if let Err(e) = buffer.append(&event.topic_name, &event.data) {
                    log::error!(
                        "[Bridge] Failed to buffer {} byte(s) for '{}': {}",
                        event.data.len(),
                        event.topic_name,
                        e
                    );
                }
            }
            log::debug!("[Bridge] Buffer writer drained");
        });

        Self {
            events_tx: Mutex::new(Some(events_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop accepting events and wait until every queued one is written.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        drop(
            self.events_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("[Bridge] Buffer writer failed: {}", e);
            }
        }
    }
}

impl EventSink for BufferWriter {
    fn on_event(&self, event: &BridgeEvent) {
        let events_tx = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let queued = events_tx
            .as_ref()
            .is_some_and(|tx| tx.send(event.clone()).is_ok());
        if !queued {
            log::warn!(
                "[Bridge] Writer closed, dropping {} byte(s) for '{}'",
                event.data.len(),
                event.topic_name
            );
        }
    }
}

/// A running relay: table, buffer and reconnect loop.
#[derive(Debug)]
pub struct Bridge {
    table: Arc<NetworkTable>,
    buffer: Arc<AccumulationBuffer>,
    writer: Arc<BufferWriter>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Bridge {
    /// Open the buffer at `config.database_path`, build the table and start
    /// reconnecting to the configured peer.
    pub fn start(config: &Config) -> Result<Self> {
        let buffer = AccumulationBuffer::open(&config.database_path)
            .with_context(|| format!("Failed to open buffer {}", config.database_path.display()))?;
        let connector = Arc::new(WsConnector::new(config.connect_timeout()));

        Ok(Self::start_with(
            config.peer(),
            connector,
            Arc::new(buffer),
            config.retry_policy(),
            config.connect_timeout(),
        ))
    }

    /// Start over an explicit connector and buffer.
    pub fn start_with(
        peer: PeerAddress,
        connector: Arc<dyn Connector>,
        buffer: Arc<AccumulationBuffer>,
        policy: RetryPolicy,
        connect_timeout: std::time::Duration,
    ) -> Self {
        let cache = Arc::new(EntryCache::new());
        let listeners = Arc::new(ListenerRegistry::new(Arc::clone(&cache)));

        log::info!("[Bridge] Relaying {} into {}", peer.url(), describe(&buffer));
        let writer = Arc::new(BufferWriter::spawn(Arc::clone(&buffer)));

        let connection = Arc::new(
            ConnectionManager::with_event_sink(
                peer,
                connector,
                cache,
                listeners,
                Arc::clone(&writer) as Arc<dyn EventSink>,
            )
            .connect_timeout(connect_timeout),
        );
        let supervisor = Supervisor::spawn(Arc::clone(&connection), policy);

        Self {
            table: Arc::new(NetworkTable::new(connection)),
            buffer,
            writer,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Client table over the relay's connection.
    #[must_use]
    pub fn table(&self) -> &Arc<NetworkTable> {
        &self.table
    }

    /// Accumulation buffer events are written to.
    #[must_use]
    pub fn buffer(&self) -> &Arc<AccumulationBuffer> {
        &self.buffer
    }

    /// Stop reconnecting, close the socket and wait for both to finish.
    ///
    /// Every event received before the socket closed is in the buffer once
    /// this returns.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.table.connection().shutdown().await;
        self.writer.close().await;
        log::info!("[Bridge] Shut down");
    }
}

fn describe(buffer: &AccumulationBuffer) -> String {
    buffer
        .path()
        .map_or_else(|| "in-memory buffer".to_string(), |p| p.display().to_string())
}
