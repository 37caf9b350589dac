//! Resolves invocations against the registry and runs them.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::audit::AuditSink;
use crate::operation::ValidationError;
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Errors returned to the transport caller.
///
/// Everything except [`DispatchError::Panicked`] and [`DispatchError::Encode`]
/// is caused by the request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid route {path:?}, expecting /<domain>/<operation>")]
    InvalidRoute { path: String },
    #[error("unknown domain {name}, expecting {}", .expected.join("|"))]
    UnknownDomain { name: String, expected: Vec<String> },
    #[error("unknown operation {name} in domain {domain}, expecting {}", .expected.join("|"))]
    UnknownOperation {
        domain: String,
        name: String,
        expected: Vec<String>,
    },
    #[error("unknown parameter {name}")]
    UnknownField { name: String },
    #[error("invalid value for {name}: {reason}")]
    InvalidField { name: String, reason: String },
    #[error("invalid request body: {reason}")]
    InvalidBody { reason: String },
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("operation {operation} panicked: {message}")]
    Panicked { operation: String, message: String },
    #[error("cannot encode result of {operation}: {source}")]
    Encode {
        operation: String,
        source: Arc<serde_json::Error>,
    },
}

impl DispatchError {
    /// Whether the request itself is at fault.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, DispatchError::Panicked { .. } | DispatchError::Encode { .. })
    }

    /// Short stable label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidRoute { .. } => "invalid_route",
            DispatchError::UnknownDomain { .. } => "unknown_domain",
            DispatchError::UnknownOperation { .. } => "unknown_operation",
            DispatchError::UnknownField { .. } => "unknown_field",
            DispatchError::InvalidField { .. } => "invalid_field",
            DispatchError::InvalidBody { .. } => "invalid_body",
            DispatchError::Validation(_) => "validation",
            DispatchError::Panicked { .. } => "panicked",
            DispatchError::Encode { .. } => "encode",
        }
    }
}

// ---------------------------------------------------------------------------
// Route / Invocation
// ---------------------------------------------------------------------------

/// Address of an operation: one or more domain segments plus the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub domain: Vec<String>,
    pub operation: String,
}

impl Route {
    #[must_use]
    pub fn new(domain: &str, operation: &str) -> Self {
        Self {
            domain: segments(domain).map(str::to_string).collect(),
            operation: operation.to_string(),
        }
    }

    /// Parses `"/<domain>[/<domain>...]/<operation>"`. The leading slash is
    /// optional and empty segments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidRoute`] when fewer than two segments
    /// are present.
    pub fn parse(path: &str) -> Result<Self, DispatchError> {
        let mut parts: Vec<&str> = segments(path).collect();
        if parts.len() < 2 {
            return Err(DispatchError::InvalidRoute {
                path: path.to_string(),
            });
        }
        let operation = parts.pop().unwrap_or_default().to_string();
        Ok(Self {
            domain: parts.into_iter().map(str::to_string).collect(),
            operation,
        })
    }

    /// Domain segments joined with `/`.
    #[must_use]
    pub fn domain_path(&self) -> String {
        self.domain.join("/")
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.domain {
            write!(f, "/{segment}")?;
        }
        write!(f, "/{}", self.operation)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// One request, as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub route: Route,
    /// Decoded body document, bound first.
    pub body: Option<Map<String, Value>>,
    /// Supplementary named parameters, bound after the body.
    pub params: Vec<(String, String)>,
}

impl Invocation {
    #[must_use]
    pub fn new(route: Route) -> Self {
        Self {
            route,
            body: None,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs invocations against a built [`Registry`], sending audit values to
/// an [`AuditSink`].
pub struct Dispatcher {
    registry: Arc<Registry>,
    audit: Arc<dyn AuditSink>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<Registry>, audit: Arc<dyn AuditSink>) -> Self {
        Self { registry, audit }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolves and runs one invocation, returning the encoded response.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] for unknown domains/operations/fields,
    /// binding and validation failures, or encoding failures.
    pub fn dispatch(&self, invocation: &Invocation) -> Result<Value, DispatchError> {
        let route = &invocation.route;
        let domain = self.registry.resolve(&route.domain)?;
        let descriptor =
            domain
                .operation(&route.operation)
                .ok_or_else(|| DispatchError::UnknownOperation {
                    domain: domain.path().to_string(),
                    name: route.operation.clone(),
                    expected: domain.operation_names(),
                })?;

        debug!(operation = %route, "dispatching");
        let outcome = descriptor.invoke(invocation.body.as_ref(), &invocation.params)?;
        self.audit.record(&descriptor.full_name(), &outcome.audit);
        Ok(outcome.response)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
