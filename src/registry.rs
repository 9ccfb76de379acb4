//! Service and procedure metadata, and the registry that holds them.
//!
//! Everything here is immutable once registered; the registry is built during
//! startup and only read afterwards, so concurrent request handling shares it
//! behind an `Arc` without locking.

use std::collections::HashMap;

use crate::schema::Schema;

/// Transport/execution strategy of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Request/response read.
    Query,
    /// Request/response write.
    Mutation,
    /// Server-push stream: the caller subscribes, the handler writes frames.
    Subscription,
    /// Full-duplex message channel over an upgraded socket.
    Bidirectional,
}

impl MethodKind {
    /// Lowercase label used in log fields and error text.
    pub fn label(self) -> &'static str {
        match self {
            MethodKind::Query => "query",
            MethodKind::Mutation => "mutation",
            MethodKind::Subscription => "subscription",
            MethodKind::Bidirectional => "bidirectional",
        }
    }
}

/// A single named operation: schemas plus a method kind.
#[derive(Debug, Clone)]
pub struct ProcedureDefinition {
    /// Unique within its service; expected to be URL-safe since it travels
    /// in the call envelope.
    pub name: String,
    /// Human-readable description, not interpreted by the runtime.
    pub description: String,
    /// Execution strategy.
    pub kind: MethodKind,
    /// Schema inbound call data must satisfy.
    pub input: Schema,
    /// Schema outbound values must satisfy (enforced per-message for
    /// subscription and bidirectional procedures).
    pub output: Schema,
}

impl ProcedureDefinition {
    /// Create a procedure definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: MethodKind,
        input: Schema,
        output: Schema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            input,
            output,
        }
    }
}

/// A named group of procedures sharing an optional middleware requirement.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    /// Unique within the registry.
    pub name: String,
    /// Procedures in declaration order.
    procedures: Vec<ProcedureDefinition>,
    /// When present, an implementation must supply middleware at build time.
    /// The string describes what the middleware is expected to do.
    pub middleware_requirement: Option<String>,
}

impl ServiceDefinition {
    /// Create an empty service definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedures: Vec::new(),
            middleware_requirement: None,
        }
    }

    /// Append a procedure. A duplicate name replaces the earlier entry with
    /// a warning, keeping its position.
    pub fn with_procedure(mut self, procedure: ProcedureDefinition) -> Self {
        if let Some(existing) = self
            .procedures
            .iter_mut()
            .find(|p| p.name == procedure.name)
        {
            tracing::warn!(
                service = %self.name,
                procedure = %procedure.name,
                "duplicate procedure definition replaces earlier one"
            );
            *existing = procedure;
        } else {
            self.procedures.push(procedure);
        }
        self
    }

    /// Declare that implementations must provide middleware.
    pub fn with_middleware_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.middleware_requirement = Some(requirement.into());
        self
    }

    /// Look up a procedure by name.
    pub fn procedure(&self, name: &str) -> Option<&ProcedureDefinition> {
        self.procedures.iter().find(|p| p.name == name)
    }

    /// Procedures in declaration order.
    pub fn procedures(&self) -> &[ProcedureDefinition] {
        &self.procedures
    }
}

/// Name → service definition map, immutable after startup.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    services: HashMap<String, ServiceDefinition>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service definition. Registering a name twice overwrites the
    /// earlier definition with a warning; it is never an error.
    pub fn register_service(&mut self, definition: ServiceDefinition) {
        if self.services.contains_key(&definition.name) {
            tracing::warn!(
                service = %definition.name,
                "service registered twice; later definition overwrites the earlier one"
            );
        }
        self.services.insert(definition.name.clone(), definition);
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    /// Look up a procedure by service and procedure name.
    pub fn procedure(&self, service: &str, procedure: &str) -> Option<&ProcedureDefinition> {
        self.service(service).and_then(|s| s.procedure(procedure))
    }
}
