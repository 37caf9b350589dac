//! `config/describe`: documentation of registered configurations.

use std::sync::Arc;

use serde::Serialize;

use super::{ConfigSchema, ConfigSet};
use crate::field::{FieldDef, FieldSchema};
use crate::operation::{Operation, ValidationError};

/// Describes one configuration by `name`, or lists them all when the name is
/// empty or unknown.
#[derive(Debug, Clone)]
pub struct Describe {
    configs: Arc<ConfigSet>,
    name: String,
}

impl Describe {
    #[must_use]
    pub fn new(configs: Arc<ConfigSet>) -> Self {
        Self {
            configs,
            name: String::new(),
        }
    }
}

const LISTING_DOC: &str = "The following items can be configured.";

/// One documented entry: a field of a configuration, or a configuration in
/// the full listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescribedItem {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub doc: String,
}

/// Response of `config/describe`. The full listing has an empty `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Description {
    pub name: String,
    pub doc: String,
    pub items: Vec<DescribedItem>,
}

impl From<ConfigSchema> for Description {
    fn from(schema: ConfigSchema) -> Self {
        Self {
            name: schema.name,
            doc: schema.doc,
            items: schema
                .items
                .into_iter()
                .map(|item| DescribedItem {
                    name: item.name.to_string(),
                    kind: item.kind.to_string(),
                    doc: item.doc.to_string(),
                })
                .collect(),
        }
    }
}

impl Operation for Describe {
    type Response = Description;
    type Audit = String;

    fn fields() -> FieldSchema<Self> {
        FieldSchema::new().field(
            FieldDef::new("name", |op: &mut Describe| &mut op.name)
                .doc("Configuration to describe. Empty lists all configurations."),
        )
    }

    fn validate(&mut self) -> Result<(), ValidationError> {
        self.name = self.name.trim().to_string();
        Ok(())
    }

    fn handle(&self) -> (Description, String) {
        let description = match self.configs.describe(&self.name) {
            Some(schema) => Description::from(schema),
            None => Description {
                name: String::new(),
                doc: LISTING_DOC.to_string(),
                items: self
                    .configs
                    .describe_all()
                    .into_iter()
                    .map(|schema| DescribedItem {
                        name: schema.name,
                        kind: schema.type_name.to_string(),
                        doc: schema.doc,
                    })
                    .collect(),
            },
        };
        (description, self.name.clone())
    }
}
