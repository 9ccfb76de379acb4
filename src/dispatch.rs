//! The dispatcher: envelope parsing, call resolution, and the
//! validate → middleware → execute pipeline.
//!
//! Each inbound call moves through parse, resolve, input validation,
//! middleware, and a kind-specific execution strategy; any step can divert
//! into [`DispatchError`], which the transport layer renders. All state the
//! dispatcher holds is read-only after startup except the connection
//! registry, so concurrent calls share it behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connections::ConnectionRegistry;
use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::registry::{MethodKind, ProcedureDefinition, SchemaRegistry};
use crate::service::{CallInfo, DuplexHandler, ProcedureHandler, ServiceImplementation};
use crate::stream::{StreamConnection, StreamFrame};

/// The `{service, procedure, data}` call descriptor sent by a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Target service name.
    pub service: String,
    /// Target procedure name.
    pub procedure: String,
    /// Call input; `null` when omitted.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parse an envelope from a request body.
    pub fn from_body(body: &[u8]) -> Result<Self, DispatchError> {
        serde_json::from_slice(body).map_err(|e| DispatchError::Envelope(e.to_string()))
    }

    /// Parse an envelope from the URL-decoded `payload` query parameter,
    /// used by transports that cannot carry a body.
    pub fn from_payload(payload: &str) -> Result<Self, DispatchError> {
        serde_json::from_str(payload).map_err(|e| DispatchError::Envelope(e.to_string()))
    }
}

/// Outcome of dispatching a call on the plain (non-upgrading) route.
pub enum CallOutcome {
    /// Request/response result, rendered as `{"data": <value>}`.
    Value(Value),
    /// Accepted subscription: the frame receiver backs the streaming body.
    Stream {
        /// The opened connection, for disconnect bookkeeping.
        connection: Arc<StreamConnection>,
        /// Frames to render as server-sent events.
        frames: mpsc::UnboundedReceiver<StreamFrame>,
    },
}

// The stream variant holds a live receiver, so Debug is by hand.
impl std::fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallOutcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            CallOutcome::Stream { connection, .. } => f
                .debug_struct("Stream")
                .field("connection", &connection.id())
                .finish_non_exhaustive(),
        }
    }
}

/// Everything resolved and validated ahead of a socket upgrade; the upgrade
/// callback runs after the HTTP response is gone, so this owns its data.
pub struct DuplexStart {
    pub(crate) handler: DuplexHandler,
    pub(crate) definition: ProcedureDefinition,
    pub(crate) input: Value,
    pub(crate) info: CallInfo,
    pub(crate) context: RequestContext,
}

/// Top-level router: owns the schema registry, the service implementations,
/// and the push-connection tracking set.
pub struct Dispatcher {
    registry: SchemaRegistry,
    implementations: HashMap<String, ServiceImplementation>,
    connections: ConnectionRegistry,
    keepalive_interval: Duration,
}

struct Resolved<'a> {
    definition: &'a ProcedureDefinition,
    handler: &'a ProcedureHandler,
    implementation: &'a ServiceImplementation,
}

impl Dispatcher {
    /// Create a dispatcher over a frozen registry.
    pub fn new(registry: SchemaRegistry, keepalive_interval: Duration) -> Self {
        Self {
            registry,
            implementations: HashMap::new(),
            connections: ConnectionRegistry::new(),
            keepalive_interval,
        }
    }

    /// Attach a built implementation for a registered service. An
    /// implementation without a matching definition is unreachable and
    /// logged as a warning.
    pub fn implement(&mut self, service: impl Into<String>, implementation: ServiceImplementation) {
        let service = service.into();
        if self.registry.service(&service).is_none() {
            tracing::warn!(
                service = %service,
                "implementation attached for unregistered service; it will never be called"
            );
        }
        self.implementations.insert(service, implementation);
    }

    /// The push-connection tracking set.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Close tracked connections ahead of listener shutdown.
    pub fn shutdown(&self) {
        self.connections.shutdown();
    }

    fn resolve(&self, service: &str, procedure: &str) -> Result<Resolved<'_>, DispatchError> {
        let definition_side = self
            .registry
            .service(service)
            .ok_or_else(|| DispatchError::UnknownService { service: service.to_string() })?;
        let implementation = self
            .implementations
            .get(service)
            .ok_or_else(|| DispatchError::UnknownService { service: service.to_string() })?;
        let definition = definition_side.procedure(procedure).ok_or_else(|| {
            DispatchError::UnknownProcedure {
                service: service.to_string(),
                procedure: procedure.to_string(),
            }
        })?;
        let handler =
            implementation
                .handler(procedure)
                .ok_or_else(|| DispatchError::UnknownProcedure {
                    service: service.to_string(),
                    procedure: procedure.to_string(),
                })?;
        Ok(Resolved { definition, handler, implementation })
    }

    /// Input validation then middleware, shared by every execution strategy.
    /// Returns the per-call context the middleware populated.
    async fn validate_and_prepare(
        &self,
        resolved: &Resolved<'_>,
        data: &Value,
        info: &CallInfo,
    ) -> Result<RequestContext, DispatchError> {
        resolved
            .definition
            .input
            .validate(data)
            .map_err(|failure| DispatchError::Validation(failure.to_string()))?;

        let mut context = RequestContext::new();
        if let Some(middleware) = resolved.implementation.middleware() {
            if let Err(error) = middleware(info, &mut context).await {
                tracing::error!(
                    service = %info.service,
                    procedure = %info.procedure,
                    %error,
                    "middleware aborted the call"
                );
                return Err(DispatchError::Middleware);
            }
        }
        Ok(context)
    }

    /// Dispatch a call arriving on the plain route. Request/response
    /// procedures resolve to a value; subscriptions resolve to an open
    /// stream immediately, with the handler detached. Bidirectional
    /// procedures must arrive on the socket route instead.
    pub async fn dispatch_call(
        self: &Arc<Self>,
        envelope: Envelope,
        info: CallInfo,
    ) -> Result<CallOutcome, DispatchError> {
        let resolved = self.resolve(&envelope.service, &envelope.procedure)?;
        let context = self.validate_and_prepare(&resolved, &envelope.data, &info).await?;

        match (resolved.definition.kind, resolved.handler) {
            (MethodKind::Query, ProcedureHandler::Query(handler))
            | (MethodKind::Mutation, ProcedureHandler::Mutation(handler)) => {
                let result = handler(envelope.data, info.clone(), context).await.map_err(
                    |error| {
                        tracing::error!(
                            service = %info.service,
                            procedure = %info.procedure,
                            %error,
                            "handler failed"
                        );
                        DispatchError::Handler
                    },
                )?;
                Ok(CallOutcome::Value(result))
            }
            (MethodKind::Subscription, ProcedureHandler::Subscription(handler)) => {
                let (connection, frames) = StreamConnection::open(
                    envelope.service.clone(),
                    envelope.procedure.clone(),
                    self.keepalive_interval,
                );
                self.connections.insert(Arc::clone(&connection));

                // The handler outlives the HTTP exchange; it runs against
                // the connection, and its failure is a log line, never a
                // response (the caller already has its 200).
                let handler = Arc::clone(handler);
                let detached_connection = Arc::clone(&connection);
                let handler_info = info.clone();
                tokio::spawn(async move {
                    if let Err(error) =
                        handler(envelope.data, handler_info.clone(), context, detached_connection)
                            .await
                    {
                        tracing::error!(
                            service = %handler_info.service,
                            procedure = %handler_info.procedure,
                            %error,
                            "subscription handler failed"
                        );
                    }
                });

                Ok(CallOutcome::Stream { connection, frames })
            }
            (MethodKind::Bidirectional, ProcedureHandler::Bidirectional(_)) => {
                Err(DispatchError::WrongTransport {
                    procedure: envelope.procedure,
                    expected: "a socket upgrade",
                })
            }
            // build() enforces kind/handler agreement, so a disagreement
            // here means the implementation map was mutated out of band.
            _ => {
                tracing::error!(
                    service = %envelope.service,
                    procedure = %envelope.procedure,
                    "handler kind disagrees with definition"
                );
                Err(DispatchError::Handler)
            }
        }
    }

    /// Run the pre-upgrade half of a bidirectional call: resolve, validate
    /// the handshake input, run middleware. Failures here surface as normal
    /// HTTP errors since the transport has not upgraded yet.
    pub async fn prepare_duplex(
        &self,
        envelope: Envelope,
        info: CallInfo,
    ) -> Result<DuplexStart, DispatchError> {
        let resolved = self.resolve(&envelope.service, &envelope.procedure)?;
        let handler = match (resolved.definition.kind, resolved.handler) {
            (MethodKind::Bidirectional, ProcedureHandler::Bidirectional(handler)) => {
                Arc::clone(handler)
            }
            _ => {
                return Err(DispatchError::WrongTransport {
                    procedure: envelope.procedure,
                    expected: resolved.definition.kind.label(),
                })
            }
        };
        let context = self.validate_and_prepare(&resolved, &envelope.data, &info).await?;
        Ok(DuplexStart {
            handler,
            definition: resolved.definition.clone(),
            input: envelope.data,
            info,
            context,
        })
    }
}
