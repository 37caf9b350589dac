//! Greeter operations registered by the bundled server binary.
//!
//! One template type backs two operations: the private `greeting` fixed at
//! registration distinguishes `greet/hello` from `greet/goodbye`.

use msf_core::{FieldDef, FieldSchema, Operation, RegistryBuilder, ValidationError};
use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct Greeter {
    greeting: String,
    name: String,
}

impl Greeter {
    #[must_use]
    pub fn with_greeting(greeting: &str) -> Self {
        Self {
            greeting: greeting.to_string(),
            name: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GreeterResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GreeterAudit {
    pub len: usize,
}

impl Operation for Greeter {
    type Response = GreeterResponse;
    type Audit = GreeterAudit;

    fn fields() -> FieldSchema<Self> {
        FieldSchema::new().field(
            FieldDef::new("Name", |g: &mut Greeter| &mut g.name)
                .alias("name")
                .doc("Who to greet. Defaults to anonymous."),
        )
    }

    fn validate(&mut self) -> Result<(), ValidationError> {
        if self.greeting.is_empty() {
            self.greeting = "Hello".to_string();
        }
        if self.name.is_empty() {
            self.name = "anonymous".to_string();
        }
        Ok(())
    }

    fn handle(&self) -> (GreeterResponse, GreeterAudit) {
        (
            GreeterResponse {
                message: format!("{} {}!", self.greeting, self.name),
            },
            GreeterAudit {
                len: self.name.len(),
            },
        )
    }
}

/// Registers `greet/hello` and `greet/goodbye`.
pub fn register(builder: &mut RegistryBuilder) {
    builder
        .register("greet", "hello", Greeter::default())
        .register("greet", "goodbye", Greeter::with_greeting("Goodbye"));
}
