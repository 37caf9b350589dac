//! MSF core: the operation contract, domain registry, dispatcher and
//! configuration set shared by every transport.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod field;
pub mod operation;
pub mod registry;

pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{
    ConfigError, ConfigItem, ConfigSchema, ConfigSet, ConfigSource, Configurable, DirectorySource,
    LogConfig, StaticSource,
};
pub use dispatch::{DispatchError, Dispatcher, Invocation, Route};
pub use domain::{Domain, OperationDescriptor, Outcome, RegistrationError};
pub use field::{BindError, FieldDef, FieldInfo, FieldSchema, FieldValue};
pub use operation::{Operation, Shape, ValidationError};
pub use registry::{Registry, RegistryBuilder, StartupError};
