//! Transport listeners and selection of the one active per process.
//!
//! Each transport registers a [`ListenerCandidate`] with a [`ListenerSet`].
//! At startup the set tries candidates in registration order and the first
//! whose `mq.<transport>` configuration loads becomes the process listener.

pub mod queue;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use msf_core::{ConfigError, ConfigSet};
use tracing::{debug, info};

use crate::service::DispatchPipeline;
use crate::shutdown::ShutdownController;

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// What a listener needs while running.
#[derive(Debug, Clone)]
pub struct ListenContext {
    pub pipeline: DispatchPipeline,
    pub shutdown: Arc<ShutdownController>,
}

/// A configured transport, ready to feed invocations into the pipeline.
#[async_trait]
pub trait Listener: Send {
    fn transport(&self) -> &'static str;

    /// Runs until shutdown (push transports) or until every worker ends
    /// (pull transports).
    ///
    /// # Errors
    ///
    /// Returns an error when the transport fails fatally.
    async fn listen(self: Box<Self>, ctx: ListenContext) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ListenerCandidate
// ---------------------------------------------------------------------------

/// A transport that may become the process listener.
pub trait ListenerCandidate: Send + Sync {
    /// Unique transport name, e.g. `rest`.
    fn transport(&self) -> &'static str;

    /// Short description used in the configuration documentation.
    fn doc(&self) -> &'static str;

    /// Registers this transport's configuration type as `name`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] from [`ConfigSet::register`].
    fn register_config(&self, configs: &ConfigSet, name: &str, doc: &str) -> Result<(), ConfigError>;

    /// Loads configuration `name` and builds the listener.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration is missing or invalid.
    fn load(&self, configs: &ConfigSet, name: &str) -> Result<Box<dyn Listener>, ConfigError>;
}

/// Configuration name of a transport.
#[must_use]
pub fn config_name(transport: &str) -> String {
    format!("mq.{transport}")
}

// ---------------------------------------------------------------------------
// ListenerSet
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("listener {transport} is already registered")]
    Duplicate { transport: String },
    #[error("cannot register listener configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no listener configured, tried {}", .attempted.join(", "))]
    NoneConfigured { attempted: Vec<String> },
}

/// Candidates in registration order.
#[derive(Default)]
pub struct ListenerSet {
    candidates: Vec<Box<dyn ListenerCandidate>>,
}

impl ListenerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate and registers its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::Duplicate`] when the transport is already
    /// present, or [`SelectionError::Config`] when its configuration cannot
    /// be registered.
    pub fn add(
        &mut self,
        candidate: impl ListenerCandidate + 'static,
        configs: &ConfigSet,
    ) -> Result<(), SelectionError> {
        let transport = candidate.transport();
        if self.transports().contains(&transport) {
            return Err(SelectionError::Duplicate {
                transport: transport.to_string(),
            });
        }
        let doc = format!(
            "Configure this to use {} for message queue processing.",
            candidate.doc()
        );
        candidate.register_config(configs, &config_name(transport), &doc)?;
        debug!(transport, "listener candidate added");
        self.candidates.push(Box::new(candidate));
        Ok(())
    }

    /// Transport names in registration order.
    #[must_use]
    pub fn transports(&self) -> Vec<&'static str> {
        self.candidates.iter().map(|c| c.transport()).collect()
    }

    /// Returns the first candidate whose configuration loads and validates.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::NoneConfigured`] listing every attempted
    /// transport when none qualifies.
    pub fn select(&self, configs: &ConfigSet) -> Result<Box<dyn Listener>, SelectionError> {
        let mut attempted = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            let transport = candidate.transport();
            match candidate.load(configs, &config_name(transport)) {
                Ok(listener) => {
                    info!(transport, "listener selected");
                    return Ok(listener);
                }
                Err(err) => {
                    info!(transport, reason = %err, "listener not configured");
                    attempted.push(transport.to_string());
                }
            }
        }
        Err(SelectionError::NoneConfigured { attempted })
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("candidates", &self.transports())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
