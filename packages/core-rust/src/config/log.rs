//! Process log levels.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{ConfigItem, Configurable};
use crate::operation::ValidationError;

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];
const FALLBACK_LEVEL: &str = "error";

/// Global log level plus per-module overrides.
///
/// Unknown level names fall back to `error`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub global: String,
    pub package: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            global: FALLBACK_LEVEL.to_string(),
            package: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// Filter directives in `EnvFilter` syntax, e.g. `error,msf_server=debug`.
    #[must_use]
    pub fn directives(&self) -> String {
        let mut out = self.global.clone();
        for (module, level) in &self.package {
            out.push(',');
            out.push_str(module);
            out.push('=');
            out.push_str(level);
        }
        out
    }
}

fn normalize(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    if LEVELS.contains(&level.as_str()) {
        level
    } else {
        FALLBACK_LEVEL.to_string()
    }
}

impl Configurable for LogConfig {
    fn validate(&mut self) -> Result<(), ValidationError> {
        self.global = normalize(&self.global);
        if self.package.keys().any(|module| module.trim().is_empty()) {
            return Err(ValidationError::new("empty module name in package levels"));
        }
        for level in self.package.values_mut() {
            *level = normalize(level);
        }
        Ok(())
    }

    fn items() -> Vec<ConfigItem> {
        vec![
            ConfigItem::new(
                "global",
                "string",
                "Level for all modules: off, error, warn, info, debug or trace. Defaults to error.",
            ),
            ConfigItem::new(
                "package",
                "object",
                "Per-module levels, e.g. {\"msf_server::listener\": \"debug\"}.",
            ),
        ]
    }
}
