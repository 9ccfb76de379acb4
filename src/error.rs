//! Error taxonomy for the runtime.
//!
//! Two families: [`BuildError`] fails at configuration time and is fatal,
//! [`DispatchError`] is scoped to a single inbound call and maps onto an
//! HTTP status. Outbound-message validation failures on live connections are
//! not part of this taxonomy; they are logged at the connection layer and the
//! offending message is dropped.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Configuration-time failures raised by
/// [`ServiceImplementationBuilder::build`](crate::service::ServiceImplementationBuilder::build).
///
/// These are the only errors that abort startup; everything else fails
/// per-request.
#[derive(Debug, Error)]
pub enum BuildError {
    /// One or more declared procedures have no handler.
    #[error("service {service} is missing handlers for: {}", missing.join(", "))]
    MissingHandlers {
        /// Service being built.
        service: String,
        /// Every unimplemented procedure name, sorted.
        missing: Vec<String>,
    },

    /// The service definition declares a middleware requirement but no
    /// middleware was set.
    #[error("service {service} requires middleware ({requirement}) but none was set")]
    MissingMiddleware {
        /// Service being built.
        service: String,
        /// The declared requirement description.
        requirement: String,
    },

    /// A handler was registered under a variant that does not match the
    /// procedure's declared method kind.
    #[error("procedure {service}/{procedure} is declared {expected} but the handler is {found}")]
    KindMismatch {
        /// Service being built.
        service: String,
        /// Offending procedure.
        procedure: String,
        /// Kind declared in the service definition.
        expected: &'static str,
        /// Kind of the registered handler.
        found: &'static str,
    },
}

/// Per-call failures produced by the dispatcher.
///
/// Each variant carries exactly what its HTTP rendering needs. 400/404
/// responses are descriptive; 500 responses are deliberately opaque since
/// middleware and handler errors may contain sensitive detail.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request body or `payload` parameter was not a well-formed call
    /// envelope.
    #[error("malformed call envelope: {0}")]
    Envelope(String),

    /// No service registered under the requested name.
    #[error("unknown service: {service}")]
    UnknownService {
        /// The name the caller used.
        service: String,
    },

    /// The service exists but has no such procedure.
    #[error("unknown procedure: {procedure} (service {service})")]
    UnknownProcedure {
        /// The service that was found.
        service: String,
        /// The name the caller used.
        procedure: String,
    },

    /// Input failed validation against the procedure's input schema.
    #[error("input validation failed: {0}")]
    Validation(String),

    /// The procedure exists but was called over the wrong transport, for
    /// example a bidirectional procedure on the plain call route.
    #[error("procedure {procedure} must be called over {expected}")]
    WrongTransport {
        /// Offending procedure.
        procedure: String,
        /// The transport the procedure requires.
        expected: &'static str,
    },

    /// Service middleware rejected or failed the call. The handler never ran.
    #[error("middleware failed")]
    Middleware,

    /// A request/response handler returned an error.
    #[error("handler failed")]
    Handler,
}

impl DispatchError {
    /// HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Envelope(_)
            | DispatchError::Validation(_)
            | DispatchError::WrongTransport { .. } => StatusCode::BAD_REQUEST,
            DispatchError::UnknownService { .. } | DispatchError::UnknownProcedure { .. } => {
                StatusCode::NOT_FOUND
            }
            DispatchError::Middleware | DispatchError::Handler => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Middleware/handler failures may carry sensitive detail; callers
            // get a generic body, the detail goes to the log at the failure
            // site.
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, body).into_response()
    }
}
