//! Schema-described RPC runtime.
//!
//! Callers invoke named procedures on named services; the runtime validates
//! input and output against declared schemas, runs per-service middleware,
//! and delivers results over request/response, server-push streams, or
//! full-duplex sockets.
//!
//! Typical wiring:
//! 1. declare services and procedures in a [`SchemaRegistry`],
//! 2. build a [`ServiceImplementation`] per service (completeness is
//!    checked once, at build time),
//! 3. attach implementations to a [`Dispatcher`],
//! 4. hand the dispatcher to [`server::serve`].

pub mod config;
pub mod connections;
pub mod context;
pub mod dispatch;
pub mod duplex;
pub mod error;
pub mod registry;
pub mod schema;
pub mod server;
pub mod service;
pub mod stream;

pub use config::RuntimeConfig;
pub use context::RequestContext;
pub use dispatch::{CallOutcome, Dispatcher, Envelope};
pub use duplex::DuplexConnection;
pub use error::{BuildError, DispatchError};
pub use registry::{MethodKind, ProcedureDefinition, SchemaRegistry, ServiceDefinition};
pub use schema::{Schema, ValidationFailure};
pub use service::{
    middleware, CallInfo, ProcedureHandler, ServiceImplementation, ServiceImplementationBuilder,
};
pub use stream::{ConnectionId, StreamConnection};
