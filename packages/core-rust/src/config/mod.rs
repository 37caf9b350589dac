//! Named, documented configuration types loaded from a pluggable source.
//!
//! Components register the configuration they need with a [`ConfigSet`]
//! during startup, then load it by name. Registration carries the field
//! documentation served by the `config/describe` operation.

pub mod describe;
pub mod log;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::operation::{short_type_name, ValidationError};

pub use describe::Describe;
pub use log::LogConfig;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration name must not be empty")]
    EmptyName,
    #[error("configuration {name} is already registered")]
    Duplicate { name: String },
    #[error("configuration {name} is not registered")]
    NotRegistered { name: String },
    #[error("configuration {name} not found")]
    Missing { name: String },
    #[error("cannot read configuration {name}: {reason}")]
    Read { name: String, reason: String },
    #[error("cannot parse configuration {name}: {reason}")]
    Parse { name: String, reason: String },
    #[error("invalid configuration {name}: {reason}")]
    Invalid { name: String, reason: String },
}

// ---------------------------------------------------------------------------
// Configurable
// ---------------------------------------------------------------------------

/// Documentation of one configuration field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigItem {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub doc: &'static str,
}

impl ConfigItem {
    #[must_use]
    pub const fn new(name: &'static str, kind: &'static str, doc: &'static str) -> Self {
        Self { name, kind, doc }
    }
}

/// A configuration type: deserialized from the source, then validated.
pub trait Configurable: DeserializeOwned + Send + Sync + 'static {
    /// Checks loaded values and fills in defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the configuration cannot be used.
    fn validate(&mut self) -> Result<(), ValidationError>;

    /// Field documentation, in display order.
    fn items() -> Vec<ConfigItem>;
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Where raw configuration documents come from.
pub trait ConfigSource: Send + Sync {
    /// Reads the document named `name`, or `None` when the source has none.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] when a
    /// document exists but cannot be used.
    fn read(&self, name: &str) -> Result<Option<Value>, ConfigError>;
}

/// Reads `<dir>/<name>.json`, trying each directory in order.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dirs: Vec<PathBuf>,
}

impl DirectorySource {
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    fn read_file(path: &Path, name: &str) -> Result<Option<Value>, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ConfigError::Read {
                    name: name.to_string(),
                    reason: format!("{}: {err}", path.display()),
                })
            }
        };
        let value = serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
            name: name.to_string(),
            reason: format!("{}: {err}", path.display()),
        })?;
        debug!(name, path = %path.display(), "loaded configuration file");
        Ok(Some(value))
    }
}

impl ConfigSource for DirectorySource {
    fn read(&self, name: &str) -> Result<Option<Value>, ConfigError> {
        for dir in &self.dirs {
            let path = dir.join(format!("{name}.json"));
            if let Some(value) = Self::read_file(&path, name)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// In-memory documents, keyed by configuration name.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    documents: BTreeMap<String, Value>,
}

impl StaticSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, document: Value) -> Self {
        self.documents.insert(name.into(), document);
        self
    }
}

impl ConfigSource for StaticSource {
    fn read(&self, name: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.documents.get(name).cloned())
    }
}

// ---------------------------------------------------------------------------
// ConfigSet
// ---------------------------------------------------------------------------

/// Documentation of one registered configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSchema {
    pub name: String,
    /// Rust type the document deserializes into.
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub doc: String,
    pub items: Vec<ConfigItem>,
}

/// Registry of named configurations over one [`ConfigSource`].
pub struct ConfigSet {
    source: Box<dyn ConfigSource>,
    registered: RwLock<BTreeMap<String, ConfigSchema>>,
}

impl ConfigSet {
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            registered: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers configuration `name` of type `T` with its documentation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyName`] or [`ConfigError::Duplicate`].
    pub fn register<T: Configurable>(&self, name: &str, doc: &str) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        let mut registered = self.registered.write();
        if registered.contains_key(name) {
            return Err(ConfigError::Duplicate {
                name: name.to_string(),
            });
        }
        registered.insert(
            name.to_string(),
            ConfigSchema {
                name: name.to_string(),
                type_name: short_type_name::<T>(),
                doc: doc.to_string(),
                items: T::items(),
            },
        );
        info!(name, "registered configuration");
        Ok(())
    }

    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.read().contains_key(name)
    }

    /// Loads and validates configuration `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotRegistered`] for unknown names,
    /// [`ConfigError::Missing`] when the source has no document, and
    /// `Read`/`Parse`/`Invalid` errors for unusable documents.
    pub fn load<T: Configurable>(&self, name: &str) -> Result<T, ConfigError> {
        let document = self
            .read_registered(name)?
            .ok_or_else(|| ConfigError::Missing {
                name: name.to_string(),
            })?;
        let config = serde_json::from_value(document).map_err(|err| ConfigError::Parse {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
        Self::validated(name, config)
    }

    /// Like [`ConfigSet::load`], but a missing document yields the validated
    /// default.
    ///
    /// # Errors
    ///
    /// See [`ConfigSet::load`].
    pub fn load_or_default<T: Configurable + Default>(&self, name: &str) -> Result<T, ConfigError> {
        match self.load(name) {
            Err(ConfigError::Missing { .. }) => {
                debug!(name, "configuration not found, using defaults");
                Self::validated(name, T::default())
            }
            other => other,
        }
    }

    /// Documentation of one registered configuration.
    #[must_use]
    pub fn describe(&self, name: &str) -> Option<ConfigSchema> {
        self.registered.read().get(name).cloned()
    }

    /// Documentation of every registered configuration, sorted by name.
    #[must_use]
    pub fn describe_all(&self) -> Vec<ConfigSchema> {
        self.registered.read().values().cloned().collect()
    }

    fn read_registered(&self, name: &str) -> Result<Option<Value>, ConfigError> {
        if !self.is_registered(name) {
            return Err(ConfigError::NotRegistered {
                name: name.to_string(),
            });
        }
        self.source.read(name)
    }

    fn validated<T: Configurable>(name: &str, mut config: T) -> Result<T, ConfigError> {
        config.validate().map_err(|err| ConfigError::Invalid {
            name: name.to_string(),
            reason: err.reason,
        })?;
        Ok(config)
    }
}

impl fmt::Debug for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSet")
            .field("registered", &self.registered.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    struct Pool {
        size: u32,
        queue_name: String,
    }

    impl Configurable for Pool {
        fn validate(&mut self) -> Result<(), ValidationError> {
            if self.size == 0 {
                self.size = 4;
            }
            if self.queue_name.is_empty() {
                return Err(ValidationError::new("missing queueName"));
            }
            Ok(())
        }

        fn items() -> Vec<ConfigItem> {
            vec![
                ConfigItem::new("size", "number", "Pool size."),
                ConfigItem::new("queueName", "string", "Queue to read."),
            ]
        }
    }

    fn set_with(source: StaticSource) -> ConfigSet {
        let set = ConfigSet::new(source);
        set.register::<Pool>("pool", "Worker pool.").unwrap();
        set
    }

    #[test]
    fn load_parses_and_validates() {
        let set = set_with(StaticSource::new().with("pool", json!({"queueName": "jobs"})));
        let pool: Pool = set.load("pool").unwrap();
        assert_eq!(pool.size, 4);
        assert_eq!(pool.queue_name, "jobs");
    }

    #[test]
    fn load_reports_each_failure() {
        let set = set_with(StaticSource::new().with("pool", json!({"size": "big"})));
        assert!(matches!(set.load::<Pool>("pool"), Err(ConfigError::Parse { .. })));
        assert!(matches!(set.load::<Pool>("other"), Err(ConfigError::NotRegistered { .. })));

        let set = set_with(StaticSource::new().with("pool", json!({})));
        assert_eq!(
            set.load::<Pool>("pool").unwrap_err(),
            ConfigError::Invalid {
                name: "pool".to_string(),
                reason: "missing queueName".to_string()
            }
        );

        let set = set_with(StaticSource::new());
        assert!(matches!(set.load::<Pool>("pool"), Err(ConfigError::Missing { .. })));
    }

    #[test]
    fn load_or_default_still_validates() {
        let set = set_with(StaticSource::new());
        assert!(matches!(
            set.load_or_default::<Pool>("pool"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn register_rejects_empty_and_duplicate_names() {
        let set = set_with(StaticSource::new());
        assert_eq!(set.register::<Pool>("", "x"), Err(ConfigError::EmptyName));
        assert!(matches!(
            set.register::<Pool>("pool", "again"),
            Err(ConfigError::Duplicate { .. })
        ));
    }

    #[test]
    fn describe_lists_items() {
        let set = set_with(StaticSource::new());
        let schema = set.describe("pool").unwrap();
        assert_eq!(schema.doc, "Worker pool.");
        assert_eq!(schema.type_name, "Pool");
        assert_eq!(schema.items[1].name, "queueName");
        assert!(set.describe("nope").is_none());
        assert_eq!(set.describe_all().len(), 1);
    }

    #[test]
    fn directory_source_tries_dirs_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("pool.json"), r#"{"queueName": "second"}"#).unwrap();
        std::fs::write(first.path().join("broken.json"), "{not json").unwrap();

        let source = DirectorySource::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(source.read("pool").unwrap(), Some(json!({"queueName": "second"})));
        assert_eq!(source.read("absent").unwrap(), None);
        assert!(matches!(source.read("broken"), Err(ConfigError::Parse { .. })));

        std::fs::write(first.path().join("pool.json"), r#"{"queueName": "first"}"#).unwrap();
        let set = ConfigSet::new(source);
        set.register::<Pool>("pool", "").unwrap();
        assert_eq!(set.load::<Pool>("pool").unwrap().queue_name, "first");
    }
}
