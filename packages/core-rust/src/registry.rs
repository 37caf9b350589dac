//! The process-wide operation registry and its startup builder.

use std::sync::Arc;

use crate::dispatch::DispatchError;
use crate::domain::{Domain, RegistrationError};
use crate::operation::Operation;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Tree of domains rooted at one unnamed root.
///
/// Built once during startup (usually through [`RegistryBuilder`]) and then
/// shared read-only by the dispatcher and the active listener.
#[derive(Debug)]
pub struct Registry {
    root: Arc<Domain>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Arc::new(Domain::root()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Arc<Domain> {
        &self.root
    }

    /// Returns the domain at a slash-separated path, creating missing
    /// domains along the way. An empty path is the root.
    pub fn domain(&self, path: &str) -> Arc<Domain> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(Arc::clone(&self.root), |domain, name| domain.subdomain(name))
    }

    /// Walks existing domains along `segments` without creating any.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownDomain`] naming the first missing
    /// segment and listing the children available at that level.
    pub fn resolve<S: AsRef<str>>(&self, segments: &[S]) -> Result<Arc<Domain>, DispatchError> {
        let mut current = Arc::clone(&self.root);
        for segment in segments {
            let name = segment.as_ref();
            current = current
                .child(name)
                .ok_or_else(|| DispatchError::UnknownDomain {
                    name: name.to_string(),
                    expected: current.child_names(),
                })?;
        }
        Ok(current)
    }

    /// Total number of registered operations across all domains.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        fn count(domain: &Domain) -> usize {
            domain.operation_names().len()
                + domain
                    .child_names()
                    .iter()
                    .filter_map(|name| domain.child(name))
                    .map(|child| count(&child))
                    .sum::<usize>()
        }
        count(&self.root)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RegistryBuilder
// ---------------------------------------------------------------------------

/// Every registration failure collected during startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} operation registration(s) failed{}", .errors.len(), bullet_list(.errors))]
pub struct StartupError {
    pub errors: Vec<RegistrationError>,
}

fn bullet_list(errors: &[RegistrationError]) -> String {
    errors.iter().map(|err| format!("\n  - {err}")).collect()
}

/// Registers operations, recording failures instead of stopping at the first.
///
/// ```
/// # use msf_core::{Operation, RegistryBuilder, ValidationError};
/// #[derive(Clone)]
/// struct Ping;
///
/// impl Operation for Ping {
///     type Response = &'static str;
///     type Audit = ();
///     fn validate(&mut self) -> Result<(), ValidationError> { Ok(()) }
///     fn handle(&self) -> (&'static str, ()) { ("pong", ()) }
/// }
///
/// let mut builder = RegistryBuilder::new();
/// builder.register("health", "ping", Ping);
/// let registry = builder.build().unwrap();
/// assert!(registry.domain("health").operation("ping").is_some());
/// ```
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: Registry,
    errors: Vec<RegistrationError>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `template` as `name` (type name when empty) in the domain at
    /// `domain_path`.
    pub fn register<T: Operation>(&mut self, domain_path: &str, name: &str, template: T) -> &mut Self {
        if let Err(err) = self.registry.domain(domain_path).register(name, template) {
            tracing::error!(error = %err, "operation registration failed");
            self.errors.push(err);
        }
        self
    }

    /// Failures recorded so far.
    #[must_use]
    pub fn errors(&self) -> &[RegistrationError] {
        &self.errors
    }

    /// Finishes registration.
    ///
    /// # Errors
    ///
    /// Returns a [`StartupError`] listing every failed registration.
    pub fn build(self) -> Result<Registry, StartupError> {
        if self.errors.is_empty() {
            Ok(self.registry)
        } else {
            Err(StartupError {
                errors: self.errors,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
