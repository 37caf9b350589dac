//! HTTP REST listener on `axum`.
//!
//! Follows a deferred startup: `bind()` claims the TCP port, `listen()`
//! serves until the stop signal, then waits for in-flight invocations.

pub mod handler;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use msf_core::{ConfigError, ConfigItem, ConfigSet, Configurable, ValidationError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use self::handler::{invoke_handler, RestState};
use self::middleware::build_http_layers;
use super::{ListenContext, Listener, ListenerCandidate};
use crate::service::DispatchPipeline;
use crate::shutdown::ShutdownController;

pub const TRANSPORT: &str = "rest";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// RestConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Bind address.
    pub addr: String,
    /// 0 in the document means the default port; tests construct the
    /// struct directly to get an OS-assigned port.
    pub port: u16,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            addr: "localhost".to_string(),
            port: 8000,
        }
    }
}

impl Configurable for RestConfig {
    fn validate(&mut self) -> Result<(), ValidationError> {
        if self.addr.trim().is_empty() {
            self.addr = "localhost".to_string();
        }
        if self.port == 0 {
            self.port = 8000;
        }
        Ok(())
    }

    fn items() -> Vec<ConfigItem> {
        vec![
            ConfigItem::new("addr", "string", "HTTP server address (defaults to localhost)"),
            ConfigItem::new("port", "number", "TCP port number to listen on (defaults to 8000)"),
        ]
    }
}

// ---------------------------------------------------------------------------
// RestCandidate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct RestCandidate;

impl ListenerCandidate for RestCandidate {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    fn doc(&self) -> &'static str {
        "HTTP REST"
    }

    fn register_config(&self, configs: &ConfigSet, name: &str, doc: &str) -> Result<(), ConfigError> {
        configs.register::<RestConfig>(name, doc)
    }

    fn load(&self, configs: &ConfigSet, name: &str) -> Result<Box<dyn Listener>, ConfigError> {
        let config = configs.load::<RestConfig>(name)?;
        Ok(Box::new(RestListener::new(config)))
    }
}

// ---------------------------------------------------------------------------
// RestListener
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RestListener {
    config: RestConfig,
    listener: Option<TcpListener>,
}

impl RestListener {
    #[must_use]
    pub fn new(config: RestConfig) -> Self {
        Self {
            config,
            listener: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Binds the configured address and returns the bound port, which
    /// differs from the configured one when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.addr, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(addr = %self.config.addr, port, "REST listener bound");
        self.listener = Some(listener);
        Ok(port)
    }
}

/// Routes every path to the invocation handler.
pub fn build_router(pipeline: DispatchPipeline, shutdown: Arc<ShutdownController>) -> Router {
    Router::new()
        .fallback(invoke_handler)
        .layer(build_http_layers())
        .with_state(RestState { pipeline, shutdown })
}

#[async_trait]
impl Listener for RestListener {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    async fn listen(self: Box<Self>, ctx: ListenContext) -> anyhow::Result<()> {
        let mut this = *self;
        if this.listener.is_none() {
            this.bind().await?;
        }
        let Some(listener) = this.listener.take() else {
            anyhow::bail!("REST listener is not bound");
        };

        let router = build_router(ctx.pipeline, Arc::clone(&ctx.shutdown));

        let stop = Arc::clone(&ctx.shutdown);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.signalled().await })
            .await?;

        if ctx.shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
            info!("REST listener drained");
        } else {
            warn!(
                in_flight = ctx.shutdown.in_flight_count(),
                "drain timeout expired with invocations in flight"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use msf_core::{Dispatcher, MemoryAuditSink, RegistryBuilder, StaticSource};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    use super::*;
    use crate::demo;
    use crate::service::build_dispatch_pipeline;

    fn pipeline() -> DispatchPipeline {
        let mut builder = RegistryBuilder::new();
        demo::register(&mut builder);
        let dispatcher = Dispatcher::new(
            Arc::new(builder.build().unwrap()),
            Arc::new(MemoryAuditSink::new()),
        );
        build_dispatch_pipeline(Arc::new(dispatcher))
    }

    fn router() -> Router {
        build_router(pipeline(), Arc::new(ShutdownController::new()))
    }

    async fn send(request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn config_defaults() {
        let mut config: RestConfig = serde_json::from_value(json!({})).unwrap();
        config.validate().unwrap();
        assert_eq!(config, RestConfig::default());

        let mut config: RestConfig = serde_json::from_value(json!({"addr": "0.0.0.0", "port": 9000})).unwrap();
        config.validate().unwrap();
        assert_eq!(config.addr, "0.0.0.0");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn candidate_needs_its_config() {
        let configs = ConfigSet::new(StaticSource::new());
        RestCandidate.register_config(&configs, "mq.rest", "doc").unwrap();
        assert!(matches!(
            RestCandidate.load(&configs, "mq.rest"),
            Err(ConfigError::Missing { .. })
        ));

        let configs = ConfigSet::new(StaticSource::new().with("mq.rest", json!({"port": 8080})));
        RestCandidate.register_config(&configs, "mq.rest", "doc").unwrap();
        let listener = RestCandidate.load(&configs, "mq.rest").unwrap();
        assert_eq!(listener.transport(), "rest");
    }

    #[tokio::test]
    async fn query_params_bind_fields() {
        let (status, body) = send(get("/greet/hello?name=Jan")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"Message": "Hello Jan!"}));
    }

    #[tokio::test]
    async fn json_body_binds_fields() {
        let request = Request::builder()
            .method("POST")
            .uri("/greet/goodbye")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"Name": "Piet"}"#))
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["Message"], "Goodbye Piet!");
    }

    #[tokio::test]
    async fn client_errors_are_bad_requests() {
        let (status, body) = send(get("/greet/wave")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "unknown operation wave in domain greet, expecting goodbye|hello"
        );

        let (status, body) = send(get("/shout/hello")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(String::from_utf8(body).unwrap(), "unknown domain shout, expecting greet");

        let (status, body) = send(get("/greet/hello?mood=happy")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(String::from_utf8(body).unwrap(), "unknown parameter mood");

        let (status, _) = send(get("/greet")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn request_id_is_propagated() {
        let response = router().oneshot(get("/greet/hello")).await.unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let mut listener = RestListener::new(RestConfig {
            addr: "127.0.0.1".to_string(),
            port: 0,
        });
        let port = listener.bind().await.unwrap();

        let shutdown = Arc::new(ShutdownController::new());
        let ctx = ListenContext {
            pipeline: pipeline(),
            shutdown: Arc::clone(&shutdown),
        };
        let server = tokio::spawn(Box::new(listener).listen(ctx));

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET /greet/hello?Name=Jan HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"));
        assert!(raw.contains("Hello Jan!"));

        shutdown.trigger_shutdown();
        server.await.unwrap().unwrap();
        assert_eq!(shutdown.in_flight_count(), 0);
    }
}
