//! Explicit field schemas used to bind request data onto operation instances.
//!
//! Every operation declares its public fields once, as an ordered list of
//! [`FieldDef`] entries (name, optional alias, type name, doc, setter). Binding
//! is a lookup in that list; nothing is discovered at runtime.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

/// Error raised while binding a single value onto a field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("unknown field {name}")]
    UnknownField { name: String },
    #[error("invalid value for field {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Input handed to a field setter: a body value or a raw named parameter.
#[derive(Debug, Clone, Copy)]
pub enum FieldInput<'a> {
    Json(&'a Value),
    Param(&'a str),
}

/// Conversion from request data into a concrete field type.
pub trait FieldValue: Sized {
    /// Type name shown in documentation.
    const TYPE_NAME: &'static str;

    /// Converts a body value.
    ///
    /// # Errors
    ///
    /// Returns a reason string when the value has the wrong type.
    fn from_json(value: &Value) -> Result<Self, String>;

    /// Converts a raw named parameter.
    ///
    /// # Errors
    ///
    /// Returns a reason string when the text cannot be parsed.
    fn from_param(raw: &str) -> Result<Self, String>;
}

impl FieldValue for String {
    const TYPE_NAME: &'static str = "string";

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(format!("expected string, got {}", json_kind(other))),
        }
    }

    fn from_param(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

impl FieldValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => Self::from_param(s),
            other => Err(format!("expected bool, got {}", json_kind(other))),
        }
    }

    fn from_param(raw: &str) -> Result<Self, String> {
        raw.parse::<bool>().map_err(|e| e.to_string())
    }
}

macro_rules! integer_field {
    ($($ty:ty => $name:literal, $getter:ident;)*) => {
        $(
            impl FieldValue for $ty {
                const TYPE_NAME: &'static str = $name;

                fn from_json(value: &Value) -> Result<Self, String> {
                    match value {
                        Value::Number(n) => n
                            .$getter()
                            .and_then(|v| <$ty>::try_from(v).ok())
                            .ok_or_else(|| format!("{n} is out of range for {}", $name)),
                        Value::String(s) => Self::from_param(s),
                        other => Err(format!("expected {}, got {}", $name, json_kind(other))),
                    }
                }

                fn from_param(raw: &str) -> Result<Self, String> {
                    raw.trim().parse::<$ty>().map_err(|e| e.to_string())
                }
            }
        )*
    };
}

integer_field! {
    i32 => "i32", as_i64;
    i64 => "i64", as_i64;
    u16 => "u16", as_u64;
    u32 => "u32", as_u64;
    u64 => "u64", as_u64;
    usize => "usize", as_u64;
}

impl FieldValue for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a float")),
            Value::String(s) => Self::from_param(s),
            other => Err(format!("expected f64, got {}", json_kind(other))),
        }
    }

    fn from_param(raw: &str) -> Result<Self, String> {
        raw.trim().parse::<f64>().map_err(|e| e.to_string())
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_json(other).map(Some),
        }
    }

    fn from_param(raw: &str) -> Result<Self, String> {
        T::from_param(raw).map(Some)
    }
}

impl FieldValue for Value {
    const TYPE_NAME: &'static str = "any";

    fn from_json(value: &Value) -> Result<Self, String> {
        Ok(value.clone())
    }

    fn from_param(raw: &str) -> Result<Self, String> {
        Ok(Value::String(raw.to_string()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

type Setter<T> = Box<dyn Fn(&mut T, FieldInput<'_>) -> Result<(), String> + Send + Sync>;

/// One public field of an operation.
pub struct FieldDef<T> {
    name: &'static str,
    alias: Option<&'static str>,
    type_name: &'static str,
    doc: &'static str,
    setter: Setter<T>,
}

impl<T: 'static> FieldDef<T> {
    /// Declares a field bound through `accessor`.
    pub fn new<V>(name: &'static str, accessor: fn(&mut T) -> &mut V) -> Self
    where
        V: FieldValue + 'static,
    {
        Self {
            name,
            alias: None,
            type_name: V::TYPE_NAME,
            doc: "",
            setter: Box::new(move |target, input| {
                let value = match input {
                    FieldInput::Json(json) => V::from_json(json)?,
                    FieldInput::Param(raw) => V::from_param(raw)?,
                };
                *accessor(target) = value;
                Ok(())
            }),
        }
    }

    /// Adds an alternative name the field also answers to.
    #[must_use]
    pub fn alias(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }

    #[must_use]
    pub fn doc(mut self, doc: &'static str) -> Self {
        self.doc = doc;
        self
    }
}

impl<T> FieldDef<T> {
    fn matches(&self, key: &str) -> bool {
        self.name == key || self.alias == Some(key)
    }

    fn set(&self, target: &mut T, input: FieldInput<'_>) -> Result<(), BindError> {
        (self.setter)(target, input).map_err(|reason| BindError::InvalidValue {
            name: self.name.to_string(),
            reason,
        })
    }

    fn info(&self) -> FieldInfo {
        FieldInfo {
            name: self.name,
            alias: self.alias,
            type_name: self.type_name,
            doc: self.doc,
        }
    }
}

impl<T> std::fmt::Debug for FieldDef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Documentation view of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldInfo {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<&'static str>,
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub doc: &'static str,
}

/// Ordered list of an operation's public fields.
pub struct FieldSchema<T> {
    fields: Vec<FieldDef<T>>,
}

impl<T: 'static> FieldSchema<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends a field declaration.
    #[must_use]
    pub fn field(mut self, def: FieldDef<T>) -> Self {
        self.fields.push(def);
        self
    }
}

impl<T> FieldSchema<T> {
    /// Checks that no two fields share a name or alias.
    ///
    /// # Errors
    ///
    /// Returns the first key that is declared more than once.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for def in &self.fields {
            for key in std::iter::once(def.name).chain(def.alias) {
                if key.is_empty() {
                    return Err("field declared with an empty name".to_string());
                }
                if !seen.insert(key) {
                    return Err(format!("field key {key:?} declared more than once"));
                }
            }
        }
        Ok(())
    }

    fn find(&self, key: &str) -> Option<&FieldDef<T>> {
        self.fields.iter().find(|def| def.matches(key))
    }

    /// Binds body keys onto matching fields. Keys naming no field are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::InvalidValue`] when a value has the wrong type.
    pub fn bind_body(&self, target: &mut T, body: &Map<String, Value>) -> Result<(), BindError> {
        for (key, value) in body {
            match self.find(key) {
                Some(def) => def.set(target, FieldInput::Json(value))?,
                None => tracing::trace!(key = %key, "ignoring body key with no matching field"),
            }
        }
        Ok(())
    }

    /// Binds one named parameter onto its field.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::UnknownField`] when no field answers to `name`,
    /// or [`BindError::InvalidValue`] when `raw` cannot be parsed.
    pub fn bind_param(&self, target: &mut T, name: &str, raw: &str) -> Result<(), BindError> {
        let def = self.find(name).ok_or_else(|| BindError::UnknownField {
            name: name.to_string(),
        })?;
        def.set(target, FieldInput::Param(raw))
    }

    /// Documentation view of every field, in declaration order.
    #[must_use]
    pub fn describe(&self) -> Vec<FieldInfo> {
        self.fields.iter().map(FieldDef::info).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<T: 'static> Default for FieldSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FieldSchema<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.fields).finish()
    }
}
