//! Domain tree and operation descriptors.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::dispatch::DispatchError;
use crate::field::{BindError, FieldInfo, FieldSchema};
use crate::operation::{short_type_name, Operation, Shape};

// ---------------------------------------------------------------------------
// RegistrationError
// ---------------------------------------------------------------------------

/// Programming mistakes detected while registering an operation.
///
/// Always fatal at startup; see [`RegistryBuilder`](crate::RegistryBuilder)
/// for aggregated reporting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("duplicate operation {domain}/{name} ({type_name})")]
    Duplicate {
        domain: String,
        name: String,
        type_name: &'static str,
    },
    #[error("invalid operation name {name:?} in domain {domain}")]
    InvalidName { domain: String, name: String },
    #[error("malformed field schema for {domain}/{name}: {reason}")]
    MalformedSchema {
        domain: String,
        name: String,
        reason: String,
    },
    #[error("invalid defaults for {domain}/{name}: {reason}")]
    InvalidDefaults {
        domain: String,
        name: String,
        reason: String,
    },
    #[error("dry-run of {domain}/{name} panicked: {message}")]
    DryRunPanicked {
        domain: String,
        name: String,
        message: String,
    },
    #[error("cannot encode {what} of {domain}/{name}: {reason}")]
    Unencodable {
        domain: String,
        name: String,
        what: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Template (type-erased operation)
// ---------------------------------------------------------------------------

/// Result of one successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub response: Value,
    pub audit: Value,
}

trait Template: Send + Sync {
    fn invoke(
        &self,
        full_name: &str,
        body: Option<&Map<String, Value>>,
        params: &[(String, String)],
    ) -> Result<Outcome, DispatchError>;
}

struct TypedTemplate<T: Operation> {
    template: T,
    schema: FieldSchema<T>,
}

impl<T: Operation> Template for TypedTemplate<T> {
    fn invoke(
        &self,
        full_name: &str,
        body: Option<&Map<String, Value>>,
        params: &[(String, String)],
    ) -> Result<Outcome, DispatchError> {
        let mut instance = self.template.clone();

        if let Some(body) = body {
            self.schema.bind_body(&mut instance, body)?;
        }
        for (name, raw) in params {
            self.schema.bind_param(&mut instance, name, raw)?;
        }

        let (response, audit) = catch_unwind(AssertUnwindSafe(|| {
            instance.validate()?;
            Ok::<_, DispatchError>(instance.handle())
        }))
        .map_err(|payload| DispatchError::Panicked {
            operation: full_name.to_string(),
            message: panic_message(payload.as_ref()),
        })??;

        let encode = |source: serde_json::Error| DispatchError::Encode {
            operation: full_name.to_string(),
            source: Arc::new(source),
        };
        Ok(Outcome {
            response: serde_json::to_value(&response).map_err(encode)?,
            audit: serde_json::to_value(&audit).map_err(encode)?,
        })
    }
}

impl From<BindError> for DispatchError {
    fn from(err: BindError) -> Self {
        match err {
            BindError::UnknownField { name } => DispatchError::UnknownField { name },
            BindError::InvalidValue { name, reason } => DispatchError::InvalidField { name, reason },
        }
    }
}

// ---------------------------------------------------------------------------
// OperationDescriptor
// ---------------------------------------------------------------------------

/// Immutable registration record of one operation.
pub struct OperationDescriptor {
    name: String,
    domain: String,
    type_name: &'static str,
    template: Box<dyn Template>,
    response: Shape,
    audit: Shape,
    fields: Vec<FieldInfo>,
}

impl OperationDescriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the owning domain, empty for the root.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// `"<domain path>/<name>"`, used for audit records and logs.
    #[must_use]
    pub fn full_name(&self) -> String {
        join_path(&self.domain, &self.name)
    }

    /// Rust type name of the template.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn response_shape(&self) -> &Shape {
        &self.response
    }

    #[must_use]
    pub fn audit_shape(&self) -> &Shape {
        &self.audit
    }

    /// Public fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Runs one invocation against a fresh clone of the template.
    ///
    /// Body keys are bound first, then `params` in order; the template itself
    /// is never modified.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] when binding, validation or encoding fails.
    pub fn invoke(
        &self,
        body: Option<&Map<String, Value>>,
        params: &[(String, String)],
    ) -> Result<Outcome, DispatchError> {
        self.template.invoke(&self.full_name(), body, params)
    }
}

impl std::fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("type_name", &self.type_name)
            .field("response", &self.response)
            .field("audit", &self.audit)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// A named namespace node holding child domains and operations.
///
/// Both maps are guarded by the domain's own locks so registration from
/// concurrent initializers is safe. Lookups after startup only take read locks.
#[derive(Debug)]
pub struct Domain {
    name: String,
    path: String,
    children: RwLock<BTreeMap<String, Arc<Domain>>>,
    operations: RwLock<BTreeMap<String, Arc<OperationDescriptor>>>,
}

impl Domain {
    pub(crate) fn root() -> Self {
        Self::with_path(String::new(), String::new())
    }

    fn with_path(name: String, path: String) -> Self {
        Self {
            name,
            path,
            children: RwLock::new(BTreeMap::new()),
            operations: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slash-separated path from the root, empty for the root itself.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the named child, creating and linking it when absent.
    pub fn subdomain(&self, name: &str) -> Arc<Domain> {
        if let Some(existing) = self.children.read().get(name) {
            return Arc::clone(existing);
        }
        let mut children = self.children.write();
        let child = children.entry(name.to_string()).or_insert_with(|| {
            debug!(parent = %self.path, name, "creating domain");
            Arc::new(Domain::with_path(
                name.to_string(),
                join_path(&self.path, name),
            ))
        });
        Arc::clone(child)
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Option<Arc<Domain>> {
        self.children.read().get(name).cloned()
    }

    /// Names of the direct children, sorted.
    #[must_use]
    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    /// Registers `template` under its type name.
    ///
    /// # Errors
    ///
    /// See [`Domain::register`].
    pub fn add<T: Operation>(&self, template: T) -> Result<Arc<OperationDescriptor>, RegistrationError> {
        self.register("", template)
    }

    /// Registers `template` as operation `name`, defaulting to the template's
    /// type name when `name` is empty.
    ///
    /// A copy of the template is validated and handled once to capture the
    /// response and audit shapes.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistrationError`] when the name is taken or invalid, the
    /// field schema is malformed, or the dry-run fails.
    pub fn register<T: Operation>(
        &self,
        name: &str,
        template: T,
    ) -> Result<Arc<OperationDescriptor>, RegistrationError> {
        let type_name = short_type_name::<T>();
        let name = if name.is_empty() { type_name } else { name };
        if name.contains('/') {
            return Err(RegistrationError::InvalidName {
                domain: self.path.clone(),
                name: name.to_string(),
            });
        }
        let duplicate = || RegistrationError::Duplicate {
            domain: self.path.clone(),
            name: name.to_string(),
            type_name,
        };
        if self.operations.read().contains_key(name) {
            return Err(duplicate());
        }

        let schema = T::fields();
        schema
            .check()
            .map_err(|reason| RegistrationError::MalformedSchema {
                domain: self.path.clone(),
                name: name.to_string(),
                reason,
            })?;
        let (response, audit) = dry_run(&self.path, name, &template)?;

        let descriptor = Arc::new(OperationDescriptor {
            name: name.to_string(),
            domain: self.path.clone(),
            type_name: std::any::type_name::<T>(),
            fields: schema.describe(),
            template: Box::new(TypedTemplate { template, schema }),
            response,
            audit,
        });

        let mut operations = self.operations.write();
        if operations.contains_key(name) {
            return Err(duplicate());
        }
        operations.insert(name.to_string(), Arc::clone(&descriptor));
        drop(operations);

        info!(
            operation = %descriptor.full_name(),
            template = descriptor.type_name,
            response = descriptor.response.type_name,
            audit = descriptor.audit.type_name,
            "registered operation"
        );
        Ok(descriptor)
    }

    /// Looks up an operation by name.
    #[must_use]
    pub fn operation(&self, name: &str) -> Option<Arc<OperationDescriptor>> {
        self.operations.read().get(name).cloned()
    }

    /// All operations of this domain, keyed by name.
    #[must_use]
    pub fn operations(&self) -> BTreeMap<String, Arc<OperationDescriptor>> {
        self.operations.read().clone()
    }

    /// Names of this domain's operations, sorted.
    #[must_use]
    pub fn operation_names(&self) -> Vec<String> {
        self.operations.read().keys().cloned().collect()
    }
}

/// Validates and handles a copy of `template`, returning the captured shapes.
fn dry_run<T: Operation>(
    domain: &str,
    name: &str,
    template: &T,
) -> Result<(Shape, Shape), RegistrationError> {
    let mut trial = template.clone();
    trial
        .validate()
        .map_err(|err| RegistrationError::InvalidDefaults {
            domain: domain.to_string(),
            name: name.to_string(),
            reason: err.reason,
        })?;

    let (response, audit) =
        catch_unwind(AssertUnwindSafe(|| trial.handle())).map_err(|payload| {
            RegistrationError::DryRunPanicked {
                domain: domain.to_string(),
                name: name.to_string(),
                message: panic_message(payload.as_ref()),
            }
        })?;

    let encode = |what: &'static str, value: Result<Value, serde_json::Error>| {
        value.map_err(|err| RegistrationError::Unencodable {
            domain: domain.to_string(),
            name: name.to_string(),
            what,
            reason: err.to_string(),
        })
    };
    let response = Shape {
        type_name: std::any::type_name::<T::Response>(),
        sample: encode("response", serde_json::to_value(&response))?,
    };
    let audit = Shape {
        type_name: std::any::type_name::<T::Audit>(),
        sample: encode("audit", serde_json::to_value(&audit))?,
    };
    Ok((response, audit))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
