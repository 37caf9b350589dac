//! Process-wide `tracing` subscriber set up from the `log` configuration.

use msf_core::LogConfig;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter directives: `RUST_LOG` when set and non-empty, the configured
/// levels otherwise.
#[must_use]
pub fn directives(config: &LogConfig, env: Option<&str>) -> String {
    match env.map(str::trim) {
        Some(env) if !env.is_empty() => env.to_string(),
        _ => config.directives(),
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error when the directives do not parse or a global subscriber
/// is already installed.
pub fn init_logging(config: &LogConfig, format: LogFormat) -> anyhow::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::try_new(directives(config, env.as_deref()))?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()?,
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn env_overrides_configured_levels() {
        let config = LogConfig {
            global: "warn".to_string(),
            package: BTreeMap::from([("msf_core".to_string(), "debug".to_string())]),
        };
        assert_eq!(directives(&config, None), "warn,msf_core=debug");
        assert_eq!(directives(&config, Some("  ")), "warn,msf_core=debug");
        assert_eq!(directives(&config, Some("trace")), "trace");
    }

    #[test]
    fn configured_directives_parse() {
        let config = LogConfig::default();
        assert!(EnvFilter::try_new(directives(&config, None)).is_ok());
    }
}
