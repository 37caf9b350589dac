//! Pull-based message queue listener.
//!
//! `nrConn` workers each hold one connection to the queue server and pop
//! envelopes from `qname`, bounded by `maxConcurrent` leases and an optional
//! message `limit`. The listener returns once every worker has ended.

pub mod backend;
pub mod budget;
pub mod consumer;
pub mod envelope;
pub mod lease;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msf_core::{ConfigError, ConfigItem, ConfigSet, Configurable, Route, ValidationError};
use serde::Deserialize;
use tracing::info;

use self::backend::QueueConnector;
use self::consumer::{Consumer, ConsumerSettings, IDLE_TIMEOUT, POLL_TIMEOUT};
use self::envelope::EnvelopeHandler;
use super::{ListenContext, Listener, ListenerCandidate};

pub const TRANSPORT: &str = "queue";

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub server: String,
    pub port: u16,
    pub nr_conn: usize,
    pub qname: String,
    /// Messages to process before stopping; -1 for unlimited.
    pub limit: i64,
    pub max_concurrent: usize,
    /// Route for envelopes without a provider.
    pub route: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: 6379,
            nr_conn: 1,
            qname: String::new(),
            limit: -1,
            max_concurrent: 100,
            route: None,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 100,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// The parsed default route, if one is configured.
    #[must_use]
    pub fn default_route(&self) -> Option<Route> {
        self.route.as_deref().and_then(|path| Route::parse(path).ok())
    }

    #[must_use]
    pub fn settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            address: self.address(),
            queue: self.qname.clone(),
            workers: self.nr_conn,
            max_concurrent: self.max_concurrent,
            limit: self.limit,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            idle_timeout: IDLE_TIMEOUT,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

impl Configurable for QueueConfig {
    fn validate(&mut self) -> Result<(), ValidationError> {
        self.qname = self.qname.trim().to_string();
        if self.qname.is_empty() {
            return Err(ValidationError::new("missing qname"));
        }
        if self.server.trim().is_empty() {
            self.server = "localhost".to_string();
        }
        if self.port == 0 {
            self.port = 6379;
        }
        if self.nr_conn == 0 {
            self.nr_conn = 1;
        }
        if self.max_concurrent == 0 {
            self.max_concurrent = 100;
        }
        if self.limit < 1 {
            self.limit = -1;
        }
        if self.reconnect_backoff_ms == 0 {
            self.reconnect_backoff_ms = 100;
        }
        self.route = self
            .route
            .take()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty());
        if let Some(path) = &self.route {
            Route::parse(path).map_err(|err| ValidationError::new(err.to_string()))?;
        }
        Ok(())
    }

    fn items() -> Vec<ConfigItem> {
        vec![
            ConfigItem::new("server", "string", "Queue server host (defaults to localhost)"),
            ConfigItem::new("port", "number", "Queue server port (defaults to 6379)"),
            ConfigItem::new("nrConn", "number", "Number of connections, one worker each (defaults to 1)"),
            ConfigItem::new("qname", "string", "Name of the queue to consume (required)"),
            ConfigItem::new("limit", "number", "Messages to process before stopping (-1 for unlimited)"),
            ConfigItem::new("maxConcurrent", "number", "Maximum messages in flight across all connections (defaults to 100)"),
            ConfigItem::new("route", "string", "Route for messages that do not name a provider"),
            ConfigItem::new("reconnectAttempts", "number", "Reconnect attempts after a lost connection (defaults to 5)"),
            ConfigItem::new("reconnectBackoffMs", "number", "Base delay between reconnect attempts (defaults to 100)"),
        ]
    }
}

// ---------------------------------------------------------------------------
// QueueCandidate
// ---------------------------------------------------------------------------

/// Queue transport over a given connector.
#[derive(Clone)]
pub struct QueueCandidate {
    connector: Arc<dyn QueueConnector>,
}

impl QueueCandidate {
    #[must_use]
    pub fn new(connector: Arc<dyn QueueConnector>) -> Self {
        Self { connector }
    }
}

impl std::fmt::Debug for QueueCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCandidate").finish_non_exhaustive()
    }
}

impl ListenerCandidate for QueueCandidate {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    fn doc(&self) -> &'static str {
        "a message queue"
    }

    fn register_config(&self, configs: &ConfigSet, name: &str, doc: &str) -> Result<(), ConfigError> {
        configs.register::<QueueConfig>(name, doc)
    }

    fn load(&self, configs: &ConfigSet, name: &str) -> Result<Box<dyn Listener>, ConfigError> {
        let config = configs.load::<QueueConfig>(name)?;
        Ok(Box::new(QueueListener::new(config, Arc::clone(&self.connector))))
    }
}

// ---------------------------------------------------------------------------
// QueueListener
// ---------------------------------------------------------------------------

pub struct QueueListener {
    config: QueueConfig,
    connector: Arc<dyn QueueConnector>,
}

impl QueueListener {
    #[must_use]
    pub fn new(config: QueueConfig, connector: Arc<dyn QueueConnector>) -> Self {
        Self { config, connector }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[async_trait]
impl Listener for QueueListener {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    async fn listen(self: Box<Self>, ctx: ListenContext) -> anyhow::Result<()> {
        let this = *self;
        let handler = EnvelopeHandler::new(ctx.pipeline, this.config.default_route());
        let consumer = Consumer::new(
            this.config.settings(),
            this.connector,
            Arc::new(handler),
            Arc::clone(&ctx.shutdown),
        );

        let report = consumer.run().await?;
        info!(
            queue = %this.config.qname,
            fetched = report.fetched,
            transport_errors = report.transport_errors,
            reconnects = report.reconnects,
            "queue listener stopped"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
