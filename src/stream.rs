//! Server-push stream connections.
//!
//! A [`StreamConnection`] is the handler-facing side of one subscription:
//! frames written here flow through an unbounded channel into the HTTP
//! response body, where they are rendered as server-sent events. The channel
//! boundary keeps the connection testable without a live socket and keeps
//! `write` synchronous-fast for handlers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Monotonic identifier for log correlation across a connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frame of a push stream, transport-agnostic. The HTTP layer renders
/// comments as `: <text>` and events as `event:`/`data:` blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Comment frame, invisible to event listeners on the client.
    Comment(String),
    /// Named event frame with a data payload.
    Event {
        /// Event name (`content` or `close`).
        name: &'static str,
        /// Serialized payload.
        data: String,
    },
}

/// One server-push logical connection.
///
/// Lifecycle is `OPEN → (write)* → CLOSED`; the closed flag is monotonic and
/// every operation on a closed connection is a logged no-op, never an error.
pub struct StreamConnection {
    id: ConnectionId,
    service: String,
    procedure: String,
    sink: Mutex<Option<mpsc::UnboundedSender<StreamFrame>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StreamConnection {
    /// Open a connection: emits the `Connected` comment immediately and
    /// starts the keepalive task. Returns the connection and the frame
    /// receiver the transport layer drains into the response body.
    pub fn open(
        service: impl Into<String>,
        procedure: impl Into<String>,
        keepalive_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::next();

        // The client watches for this comment to detect an established
        // stream before any content arrives.
        let _ = tx.send(StreamFrame::Comment("Connected".to_string()));

        let connection = Arc::new(Self {
            id,
            service: service.into(),
            procedure: procedure.into(),
            sink: Mutex::new(Some(tx)),
            keepalive: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let keepalive = spawn_keepalive(Arc::downgrade(&connection), keepalive_interval);
        *connection
            .keepalive
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(keepalive);

        (connection, rx)
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize `message` as JSON and append a `content` frame.
    ///
    /// Writing to a closed connection, or one whose client has gone away, is
    /// logged and ignored.
    pub fn write(&self, message: &Value) {
        if self.is_closed() {
            tracing::debug!(
                connection = %self.id,
                service = %self.service,
                procedure = %self.procedure,
                "write ignored; stream already closed"
            );
            return;
        }
        let frame = StreamFrame::Event {
            name: "content",
            data: message.to_string(),
        };
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match sink.as_ref() {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::debug!(
                        connection = %self.id,
                        service = %self.service,
                        procedure = %self.procedure,
                        "write dropped; client went away"
                    );
                }
            }
            None => {
                tracing::debug!(connection = %self.id, "write ignored; sink released");
            }
        }
    }

    /// Append a keepalive comment. Returns whether the keepalive task
    /// should keep running.
    ///
    /// Goes through the same sink lock as `write` and `close`, with the
    /// closed flag re-checked under the lock, so a tick racing `close()`
    /// can never land a frame after the close frame.
    fn send_keepalive(&self) -> bool {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match sink.as_ref() {
            Some(tx) => {
                if tx.send(StreamFrame::Comment("keepalive".to_string())).is_err() {
                    tracing::debug!(connection = %self.id, "keepalive stopped; client went away");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Close the connection. Idempotent: the first call emits a best-effort
    /// `close` frame, cancels the keepalive task, and releases the sink so
    /// the response body ends; later calls log and do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(connection = %self.id, "close ignored; stream already closed");
            return;
        }

        if let Some(handle) = self
            .keepalive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = sink {
            let _ = tx.send(StreamFrame::Event {
                name: "close",
                data: "close".to_string(),
            });
            // Dropping the last sender ends the receiver stream.
        }

        tracing::debug!(
            connection = %self.id,
            service = %self.service,
            procedure = %self.procedure,
            "push stream closed"
        );
    }
}

fn spawn_keepalive(connection: Weak<StreamConnection>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would double up with the Connected frame.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(connection) = connection.upgrade() else {
                break;
            };
            if !connection.send_keepalive() {
                break;
            }
        }
    })
}
