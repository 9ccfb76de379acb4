//! Tracking of outstanding push connections for graceful shutdown.
//!
//! Only server-push streams are tracked: duplex connections end with their
//! socket, which the listener tears down when it stops accepting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::stream::{ConnectionId, StreamConnection};

/// Registry of open push connections: add on open, remove on close, close
/// everything on shutdown.
#[derive(Default)]
pub struct ConnectionRegistry {
    streams: Mutex<HashMap<ConnectionId, Arc<StreamConnection>>>,
    shut_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection. During shutdown new connections are
    /// closed immediately instead of tracked.
    pub fn insert(&self, connection: Arc<StreamConnection>) {
        if self.shut_down.load(Ordering::SeqCst) {
            tracing::warn!(
                connection = %connection.id(),
                "connection opened during shutdown; closing immediately"
            );
            connection.close();
            return;
        }
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection.id(), connection);
    }

    /// Stop tracking a connection once it has closed.
    pub fn remove(&self, id: ConnectionId) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Number of currently tracked connections.
    pub fn len(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no connections are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every tracked connection. Idempotent: a second call is a
    /// logged no-op.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown already performed; ignoring");
            return;
        }
        let connections: Vec<Arc<StreamConnection>> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        tracing::info!(count = connections.len(), "closing tracked push connections");
        for connection in connections {
            connection.close();
        }
    }
}
