//! HTTP transport: router construction, the three call routes, and the
//! serve loop with signal-driven graceful shutdown.
//!
//! All RPC traffic lives under one configurable path prefix:
//!
//! ```text
//! {prefix}
//! ├── POST /          - envelope in the body (query/mutation/subscription)
//! ├── GET  /?payload= - envelope in a query parameter, for body-less
//! │                     transports (EventSource handshakes)
//! └── GET  /socket    - bidirectional WebSocket upgrade handshake
//! ```
//!
//! Anything outside the prefix is answered with 400.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;

use crate::config::RuntimeConfig;
use crate::dispatch::{CallOutcome, Dispatcher, DuplexStart, Envelope};
use crate::duplex::{drive_socket, DuplexConnection};
use crate::error::DispatchError;
use crate::service::CallInfo;
use crate::stream::{StreamConnection, StreamFrame};

/// Build the complete router for a dispatcher.
///
/// The timeout layer bounds time-to-response for every route; streaming
/// bodies and upgraded sockets are unaffected since their responses are
/// produced immediately.
pub fn build_router(dispatcher: Arc<Dispatcher>, config: &RuntimeConfig) -> Router {
    let rpc = Router::new()
        .route("/", get(handle_payload_call).post(handle_body_call))
        .route("/socket", get(handle_socket_upgrade))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout(),
        ))
        .with_state(dispatcher);

    let prefix = config.path_prefix.clone();
    Router::new()
        .nest(&config.path_prefix, rpc)
        .fallback(move || {
            let prefix = prefix.clone();
            async move {
                (
                    StatusCode::BAD_REQUEST,
                    format!("all calls must be routed under {prefix}"),
                )
            }
        })
}

/// Bind the listener and serve until a termination signal arrives, then
/// close tracked push connections and stop accepting.
pub async fn serve(dispatcher: Arc<Dispatcher>, config: RuntimeConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, prefix = %config.path_prefix, "rpc server listening");

    let router = build_router(Arc::clone(&dispatcher), &config);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(dispatcher))
        .await?;
    tracing::info!("rpc server stopped");
    Ok(())
}

async fn shutdown_signal(dispatcher: Arc<Dispatcher>) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("termination signal received; shutting down");
    // Tracked connections close first, then the serve loop stops accepting.
    dispatcher.shutdown();
}

#[derive(Deserialize)]
struct PayloadQuery {
    payload: Option<String>,
}

fn call_info(envelope: &Envelope, method: Method, headers: HeaderMap) -> CallInfo {
    CallInfo {
        service: envelope.service.clone(),
        procedure: envelope.procedure.clone(),
        method,
        headers,
    }
}

/// POST route: envelope in the JSON body.
async fn handle_body_call(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match Envelope::from_body(&body) {
        Ok(envelope) => envelope,
        Err(error) => return error.into_response(),
    };
    dispatch_and_render(&dispatcher, envelope, method, headers).await
}

/// GET route: envelope in the `payload` query parameter.
async fn handle_payload_call(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<PayloadQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let envelope = match parse_payload(query) {
        Ok(envelope) => envelope,
        Err(error) => return error.into_response(),
    };
    dispatch_and_render(&dispatcher, envelope, method, headers).await
}

fn parse_payload(query: PayloadQuery) -> Result<Envelope, DispatchError> {
    let payload = query
        .payload
        .ok_or_else(|| DispatchError::Envelope("missing payload parameter".to_string()))?;
    Envelope::from_payload(&payload)
}

async fn dispatch_and_render(
    dispatcher: &Arc<Dispatcher>,
    envelope: Envelope,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let info = call_info(&envelope, method, headers);
    match dispatcher.dispatch_call(envelope, info).await {
        Ok(CallOutcome::Value(value)) => Json(json!({ "data": value })).into_response(),
        Ok(CallOutcome::Stream { connection, frames }) => {
            let body = FrameStream {
                frames,
                connection,
                dispatcher: Arc::clone(dispatcher),
            };
            Sse::new(body).into_response()
        }
        Err(error) => error.into_response(),
    }
}

/// GET socket route: run resolution, validation, and middleware before the
/// upgrade so failures surface as ordinary HTTP errors, then hand the socket
/// to the duplex driver.
async fn handle_socket_upgrade(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<PayloadQuery>,
    method: Method,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let envelope = match parse_payload(query) {
        Ok(envelope) => envelope,
        Err(error) => return error.into_response(),
    };
    let info = call_info(&envelope, method, headers);
    match dispatcher.prepare_duplex(envelope, info).await {
        Ok(start) => upgrade.on_upgrade(move |socket| run_duplex(socket, start)),
        Err(error) => error.into_response(),
    }
}

async fn run_duplex(socket: WebSocket, start: DuplexStart) {
    let (connection, outbound) = DuplexConnection::open(
        start.info.service.clone(),
        start.definition.name.clone(),
        start.definition.input.clone(),
        start.definition.output.clone(),
    );
    tracing::info!(
        connection = %connection.id(),
        service = %start.info.service,
        procedure = %start.info.procedure,
        "duplex connection established"
    );

    // The handler registers its message/close listeners here; afterwards the
    // socket's own event loop drives dispatch for the connection lifetime.
    if let Err(error) =
        (start.handler)(start.input, start.info.clone(), start.context, Arc::clone(&connection))
            .await
    {
        tracing::error!(
            connection = %connection.id(),
            service = %start.info.service,
            procedure = %start.info.procedure,
            %error,
            "bidirectional handler failed; connection stays open"
        );
    }

    drive_socket(socket, connection, outbound).await;
}

/// Streaming response body for one push connection. Ends when the
/// connection's channel closes; dropping it (the client went away, or the
/// body finished) funnels into the connection's close path and drops its
/// tracking entry.
struct FrameStream {
    frames: mpsc::UnboundedReceiver<StreamFrame>,
    connection: Arc<StreamConnection>,
    dispatcher: Arc<Dispatcher>,
}

impl Stream for FrameStream {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.frames.poll_recv(cx) {
            Poll::Ready(Some(StreamFrame::Comment(text))) => {
                Poll::Ready(Some(Ok(Event::default().comment(text))))
            }
            Poll::Ready(Some(StreamFrame::Event { name, data })) => {
                Poll::Ready(Some(Ok(Event::default().event(name).data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        // Transport-level abort and normal stream end both land here;
        // close() is idempotent so the double path is harmless.
        self.connection.close();
        self.dispatcher.connections().remove(self.connection.id());
    }
}
