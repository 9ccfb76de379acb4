//! Service implementations: handlers, middleware, and the builder that
//! checks them against a [`ServiceDefinition`] at configuration time.
//!
//! Completeness is checked exactly once, in [`ServiceImplementationBuilder::build`];
//! nothing is re-checked per request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use serde_json::Value;

use crate::context::RequestContext;
use crate::duplex::DuplexConnection;
use crate::error::BuildError;
use crate::registry::{MethodKind, ServiceDefinition};
use crate::stream::StreamConnection;

/// Boxed future returned by handlers and middleware.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// The slice of the raw request handed to middleware and handlers.
///
/// This is a per-call snapshot, not a live request object; it stays valid for
/// detached subscription and duplex handlers that outlive the HTTP exchange.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Target service name from the envelope.
    pub service: String,
    /// Target procedure name from the envelope.
    pub procedure: String,
    /// HTTP method the call arrived with.
    pub method: Method,
    /// Request headers, for middleware concerns such as auth tokens.
    pub headers: HeaderMap,
}

/// Handler for request/response procedures: input in, one value out.
pub type UnaryHandler =
    Arc<dyn Fn(Value, CallInfo, RequestContext) -> HandlerFuture<Value> + Send + Sync>;

/// Handler for server-push procedures: runs detached, writes to the stream.
pub type SubscriptionHandler = Arc<
    dyn Fn(Value, CallInfo, RequestContext, Arc<StreamConnection>) -> HandlerFuture<()>
        + Send
        + Sync,
>;

/// Handler for full-duplex procedures: registers listeners on the connection.
pub type DuplexHandler = Arc<
    dyn Fn(Value, CallInfo, RequestContext, Arc<DuplexConnection>) -> HandlerFuture<()>
        + Send
        + Sync,
>;

/// Per-service middleware, run strictly before any handler. It may inspect
/// the call and populate the context; an error aborts the call with a 500
/// and the handler never runs.
pub type Middleware = Arc<
    dyn for<'a> Fn(
            &'a CallInfo,
            &'a mut RequestContext,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>
        + Send
        + Sync,
>;

/// One registered handler, tagged by the method kind it serves. The builder
/// rejects a handler whose variant disagrees with the procedure's declared
/// kind, so dispatch can match exhaustively without re-checking.
#[derive(Clone)]
pub enum ProcedureHandler {
    /// Request/response read.
    Query(UnaryHandler),
    /// Request/response write.
    Mutation(UnaryHandler),
    /// Server-push stream.
    Subscription(SubscriptionHandler),
    /// Full-duplex channel.
    Bidirectional(DuplexHandler),
}

impl ProcedureHandler {
    /// Wrap a closure as a query handler.
    pub fn query<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, CallInfo, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        ProcedureHandler::Query(Arc::new(move |input, info, ctx| Box::pin(f(input, info, ctx))))
    }

    /// Wrap a closure as a mutation handler.
    pub fn mutation<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, CallInfo, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        ProcedureHandler::Mutation(Arc::new(move |input, info, ctx| Box::pin(f(input, info, ctx))))
    }

    /// Wrap a closure as a subscription handler.
    pub fn subscription<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, CallInfo, RequestContext, Arc<StreamConnection>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        ProcedureHandler::Subscription(Arc::new(move |input, info, ctx, conn| {
            Box::pin(f(input, info, ctx, conn))
        }))
    }

    /// Wrap a closure as a bidirectional handler.
    pub fn bidirectional<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, CallInfo, RequestContext, Arc<DuplexConnection>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        ProcedureHandler::Bidirectional(Arc::new(move |input, info, ctx, conn| {
            Box::pin(f(input, info, ctx, conn))
        }))
    }

    fn kind_label(&self) -> &'static str {
        match self {
            ProcedureHandler::Query(_) => "query",
            ProcedureHandler::Mutation(_) => "mutation",
            ProcedureHandler::Subscription(_) => "subscription",
            ProcedureHandler::Bidirectional(_) => "bidirectional",
        }
    }

    fn matches(&self, kind: MethodKind) -> bool {
        matches!(
            (self, kind),
            (ProcedureHandler::Query(_), MethodKind::Query)
                | (ProcedureHandler::Mutation(_), MethodKind::Mutation)
                | (ProcedureHandler::Subscription(_), MethodKind::Subscription)
                | (ProcedureHandler::Bidirectional(_), MethodKind::Bidirectional)
        )
    }
}

/// Wrap a closure as service middleware.
pub fn middleware<F>(f: F) -> Middleware
where
    F: for<'a> Fn(
            &'a CallInfo,
            &'a mut RequestContext,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// An immutable, build-time-validated set of handlers for one service.
#[derive(Clone)]
pub struct ServiceImplementation {
    handlers: HashMap<String, ProcedureHandler>,
    middleware: Option<Middleware>,
}

impl ServiceImplementation {
    /// Look up the handler for a procedure.
    pub fn handler(&self, procedure: &str) -> Option<&ProcedureHandler> {
        self.handlers.get(procedure)
    }

    /// The service middleware, if any.
    pub fn middleware(&self) -> Option<&Middleware> {
        self.middleware.as_ref()
    }
}

// Handlers are trait objects, so Debug is by hand: the handler names and
// whether middleware is present are the useful part.
impl std::fmt::Debug for ServiceImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        handlers.sort_unstable();
        f.debug_struct("ServiceImplementation")
            .field("handlers", &handlers)
            .field("middleware", &self.middleware.is_some())
            .finish()
    }
}

/// Accumulates handlers for a service and validates the set against the
/// service definition once, at [`build`](Self::build).
pub struct ServiceImplementationBuilder {
    definition: Arc<ServiceDefinition>,
    handlers: HashMap<String, ProcedureHandler>,
    middleware: Option<Middleware>,
}

impl ServiceImplementationBuilder {
    /// Start building an implementation of `definition`.
    pub fn new(definition: Arc<ServiceDefinition>) -> Self {
        Self {
            definition,
            handlers: HashMap::new(),
            middleware: None,
        }
    }

    /// Register a handler keyed by procedure name. Nothing is validated at
    /// this point; a repeated name replaces the earlier handler.
    pub fn handler(mut self, procedure: impl Into<String>, handler: ProcedureHandler) -> Self {
        self.handlers.insert(procedure.into(), handler);
        self
    }

    /// Set the service middleware.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Validate and freeze the implementation.
    ///
    /// Fails fast when any declared procedure lacks a handler (enumerating
    /// every missing name), when a handler's kind disagrees with the
    /// declaration, or when required middleware is absent. Handlers for
    /// undeclared procedures are tolerated with a warning; they are
    /// unreachable since dispatch resolves through the definition.
    pub fn build(self) -> Result<ServiceImplementation, BuildError> {
        let service = &self.definition.name;

        let mut missing: Vec<String> = self
            .definition
            .procedures()
            .iter()
            .filter(|p| !self.handlers.contains_key(&p.name))
            .map(|p| p.name.clone())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(BuildError::MissingHandlers {
                service: service.clone(),
                missing,
            });
        }

        for name in self.handlers.keys() {
            if self.definition.procedure(name).is_none() {
                tracing::warn!(
                    service = %service,
                    procedure = %name,
                    "handler registered for undeclared procedure; it will never be called"
                );
            }
        }

        for procedure in self.definition.procedures() {
            if let Some(handler) = self.handlers.get(&procedure.name) {
                if !handler.matches(procedure.kind) {
                    return Err(BuildError::KindMismatch {
                        service: service.clone(),
                        procedure: procedure.name.clone(),
                        expected: procedure.kind.label(),
                        found: handler.kind_label(),
                    });
                }
            }
        }

        if let Some(requirement) = &self.definition.middleware_requirement {
            if self.middleware.is_none() {
                return Err(BuildError::MissingMiddleware {
                    service: service.clone(),
                    requirement: requirement.clone(),
                });
            }
        }

        Ok(ServiceImplementation {
            handlers: self.handlers,
            middleware: self.middleware,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcedureDefinition;
    use crate::schema::Schema;
    use serde_json::json;

    fn users_definition() -> Arc<ServiceDefinition> {
        Arc::new(
            ServiceDefinition::new("Users")
                .with_procedure(ProcedureDefinition::new(
                    "GetUser",
                    "fetch one user",
                    MethodKind::Query,
                    Schema::object([("id", Schema::string(), true)]),
                    Schema::Any,
                ))
                .with_procedure(ProcedureDefinition::new(
                    "DeleteUser",
                    "remove one user",
                    MethodKind::Mutation,
                    Schema::object([("id", Schema::string(), true)]),
                    Schema::Boolean,
                )),
        )
    }

    fn noop_query() -> ProcedureHandler {
        ProcedureHandler::query(|_, _, _| async { Ok(json!(true)) })
    }

    fn noop_mutation() -> ProcedureHandler {
        ProcedureHandler::mutation(|_, _, _| async { Ok(json!(true)) })
    }

    #[test]
    fn test_build_fails_enumerating_every_missing_handler() {
        let err = ServiceImplementationBuilder::new(users_definition())
            .build()
            .unwrap_err();
        match err {
            BuildError::MissingHandlers { service, missing } => {
                assert_eq!(service, "Users");
                assert_eq!(missing, vec!["DeleteUser".to_string(), "GetUser".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_partial_then_complete() {
        let err = ServiceImplementationBuilder::new(users_definition())
            .handler("GetUser", noop_query())
            .build()
            .unwrap_err();
        match err {
            BuildError::MissingHandlers { missing, .. } => {
                assert_eq!(missing, vec!["DeleteUser".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let built = ServiceImplementationBuilder::new(users_definition())
            .handler("GetUser", noop_query())
            .handler("DeleteUser", noop_mutation())
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn test_extra_handler_tolerated() {
        let built = ServiceImplementationBuilder::new(users_definition())
            .handler("GetUser", noop_query())
            .handler("DeleteUser", noop_mutation())
            .handler("NotDeclared", noop_query())
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let err = ServiceImplementationBuilder::new(users_definition())
            .handler("GetUser", noop_mutation())
            .handler("DeleteUser", noop_mutation())
            .build()
            .unwrap_err();
        match err {
            BuildError::KindMismatch { procedure, expected, found, .. } => {
                assert_eq!(procedure, "GetUser");
                assert_eq!(expected, "query");
                assert_eq!(found, "mutation");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_debug_shows_handler_names_not_closures() {
        let built = ServiceImplementationBuilder::new(users_definition())
            .handler("GetUser", noop_query())
            .handler("DeleteUser", noop_mutation())
            .build()
            .unwrap();
        let rendered = format!("{built:?}");
        assert!(rendered.contains("DeleteUser"));
        assert!(rendered.contains("GetUser"));
        assert!(rendered.contains("middleware: false"));
    }

    #[test]
    fn test_required_middleware_enforced() {
        let definition = Arc::new(
            ServiceDefinition::new("Admin")
                .with_procedure(ProcedureDefinition::new(
                    "Reset",
                    "",
                    MethodKind::Mutation,
                    Schema::Any,
                    Schema::Boolean,
                ))
                .with_middleware_requirement("must verify an admin token"),
        );

        let err = ServiceImplementationBuilder::new(definition.clone())
            .handler("Reset", noop_mutation())
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingMiddleware { .. }));

        let built = ServiceImplementationBuilder::new(definition)
            .handler("Reset", noop_mutation())
            .middleware(middleware(|_, ctx| {
                Box::pin(async move {
                    ctx.insert("admin", json!(true));
                    Ok(())
                })
            }))
            .build();
        assert!(built.is_ok());
    }
}
