//! The behavioral contract every registrable unit of work satisfies.

use serde::Serialize;

use crate::field::FieldSchema;

/// A unit of work that is validated, then handled.
///
/// A registered value acts as a *template*: each invocation clones it, binds
/// request data onto the public fields listed by [`Operation::fields`], then
/// calls [`validate`](Operation::validate) and [`handle`](Operation::handle)
/// on the clone. Fields not listed in the schema are private defaults fixed at
/// registration time and can never be set by a caller.
///
/// `handle` is also run once at registration against the template's default
/// values (after `validate`) to capture the response and audit shapes, so it
/// must be safe to execute without external resources or irreversible effects.
pub trait Operation: Clone + Send + Sync + 'static {
    /// Value returned to the caller.
    type Response: Serialize;
    /// Value recorded for observability, never returned to the caller.
    type Audit: Serialize;

    /// Public fields that request data may bind onto.
    fn fields() -> FieldSchema<Self> {
        FieldSchema::new()
    }

    /// Checks bound request data, normalizing or defaulting fields in place.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing why the request is invalid.
    fn validate(&mut self) -> Result<(), ValidationError>;

    /// Produces the response and the audit record.
    fn handle(&self) -> (Self::Response, Self::Audit);
}

/// Rejection reason returned by [`Operation::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Declared shape of a response or audit value, captured by the
/// registration dry-run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shape {
    /// Rust type name of the value.
    #[serde(rename = "type")]
    pub type_name: &'static str,
    /// Value produced by the dry-run against the template defaults.
    pub sample: serde_json::Value,
}

/// Short type name used as the default operation name: the last path
/// segment of the Rust type name, with generic arguments stripped.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
