//! Full-duplex message connections.
//!
//! A [`DuplexConnection`] sits between the handler and one upgraded
//! WebSocket. Inbound frames are schema-validated and fanned out to named
//! listeners in registration order; outbound messages are schema-validated
//! before anything reaches the socket. As with push streams, an unbounded
//! channel separates connection logic from the socket so both sides stay
//! independently testable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::schema::{Schema, ValidationFailure};
use crate::stream::ConnectionId;

/// Why an inbound frame was rejected before reaching any listener.
///
/// The socket driver logs these; they never tear down the connection or the
/// process.
#[derive(Debug, Error)]
pub enum InboundError {
    /// Frame was not valid JSON.
    #[error("inbound frame is not valid JSON: {0}")]
    Parse(String),
    /// Frame failed the procedure's input schema.
    #[error("inbound message failed validation: {0}")]
    Validation(#[from] ValidationFailure),
}

type ListenerFn = Arc<
    dyn Fn(
            Arc<DuplexConnection>,
            Value,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

type CloseFn = Box<
    dyn FnOnce(
            Option<String>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

struct MessageListener {
    name: String,
    callback: ListenerFn,
}

/// One full-duplex logical connection bound to an upgraded socket.
pub struct DuplexConnection {
    id: ConnectionId,
    service: String,
    procedure: String,
    input_schema: Schema,
    output_schema: Schema,
    listeners: RwLock<Vec<MessageListener>>,
    close_listeners: Mutex<Vec<CloseFn>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: AtomicBool,
}

impl DuplexConnection {
    /// Create a connection. Returns the connection and the outbound frame
    /// receiver the socket writer drains.
    pub fn open(
        service: impl Into<String>,
        procedure: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            service: service.into(),
            procedure: procedure.into(),
            input_schema,
            output_schema,
            listeners: RwLock::new(Vec::new()),
            close_listeners: Mutex::new(Vec::new()),
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
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

    /// Register a named callback invoked for every inbound message that
    /// passes input validation, in registration order.
    pub fn add_message_listener<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(Arc<DuplexConnection>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let listener = MessageListener {
            name: name.into(),
            callback: Arc::new(move |conn, msg| Box::pin(callback(conn, msg))),
        };
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Register a callback run exactly once when the connection closes.
    pub fn add_close_listener<F, Fut>(&self, callback: F)
    where
        F: FnOnce(Option<String>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.close_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(move |reason| Box::pin(callback(reason))));
    }

    /// Entry point for each inbound socket frame.
    ///
    /// Parses and validates the frame, then invokes every registered
    /// listener with the typed message. Listener callbacks are called in
    /// registration order but their futures run as independent tasks; a
    /// failing listener is logged and never affects the others or the
    /// connection. The returned error covers parse/validation rejection
    /// only, for the socket driver to log.
    pub fn handle_inbound(self: &Arc<Self>, raw: &str) -> Result<(), InboundError> {
        let message: Value =
            serde_json::from_str(raw).map_err(|e| InboundError::Parse(e.to_string()))?;
        self.input_schema.validate(&message)?;

        let listeners: Vec<(String, ListenerFn)> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|l| (l.name.clone(), Arc::clone(&l.callback)))
            .collect();

        for (name, callback) in listeners {
            // Calling the closure here fixes invocation order; completion
            // order across messages is unspecified.
            let future = callback(Arc::clone(self), message.clone());
            let service = self.service.clone();
            let procedure = self.procedure.clone();
            let id = self.id;
            tokio::spawn(async move {
                if let Err(error) = future.await {
                    tracing::error!(
                        connection = %id,
                        service = %service,
                        procedure = %procedure,
                        listener = %name,
                        %error,
                        "duplex message listener failed"
                    );
                }
            });
        }
        Ok(())
    }

    /// Validate `message` against the output schema and send it as one JSON
    /// text frame. A message that fails validation is logged and dropped;
    /// the connection stays open and nothing reaches the socket.
    pub fn send_message(&self, message: &Value) {
        if self.is_closed() {
            tracing::debug!(
                connection = %self.id,
                service = %self.service,
                procedure = %self.procedure,
                "send ignored; duplex connection already closed"
            );
            return;
        }
        if let Err(failure) = self.output_schema.validate(message) {
            tracing::error!(
                connection = %self.id,
                service = %self.service,
                procedure = %self.procedure,
                %failure,
                "outbound duplex message failed validation; dropped"
            );
            return;
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => {
                if tx.send(message.to_string()).is_err() {
                    tracing::debug!(connection = %self.id, "send dropped; socket writer gone");
                }
            }
            None => {
                tracing::debug!(connection = %self.id, "send ignored; outbound released");
            }
        }
    }

    /// Close the connection. Idempotent: the first call runs every close
    /// listener exactly once, each error-isolated, then releases the
    /// outbound channel so the socket writer shuts the socket down.
    pub async fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                connection = %self.id,
                "close ignored; duplex connection already closed"
            );
            return;
        }

        let listeners: Vec<CloseFn> = self
            .close_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for listener in listeners {
            if let Err(error) = listener(reason.clone()).await {
                tracing::error!(
                    connection = %self.id,
                    service = %self.service,
                    procedure = %self.procedure,
                    %error,
                    "duplex close listener failed"
                );
            }
        }

        drop(
            self.outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        tracing::debug!(
            connection = %self.id,
            service = %self.service,
            procedure = %self.procedure,
            reason = reason.as_deref().unwrap_or("none"),
            "duplex connection closed"
        );
    }
}

/// Drive one upgraded socket for the lifetime of its connection.
///
/// The writer half drains outbound frames until the channel ends, then sends
/// a close frame. The reader half feeds inbound text frames through the
/// connection, logging rejected frames, until the peer disconnects; either
/// exit path funnels into the same [`DuplexConnection::close`].
pub(crate) async fn drive_socket(
    socket: WebSocket,
    connection: Arc<DuplexConnection>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let (mut sink, mut source) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(error) = connection.handle_inbound(text.as_str()) {
                    tracing::warn!(
                        connection = %connection.id(),
                        %error,
                        "rejected inbound duplex frame"
                    );
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong frames are not part of the protocol
            Err(error) => {
                tracing::debug!(connection = %connection.id(), %error, "socket read failed");
                break;
            }
        }
    }

    connection.close(Some("socket disconnected".to_string())).await;
    let _ = writer.await;
}
