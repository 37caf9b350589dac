//! Queue message envelope and its dispatch.
//!
//! A message is a JSON document:
//!
//! ```json
//! {"provider": "/greet/hello", "request": {"Name": "Jan"}, "params": {}, "replyTo": "replies"}
//! ```
//!
//! Every key is optional. Without `provider` the listener's configured
//! route is used; a message with neither is discarded.

use async_trait::async_trait;
use bytes::Bytes;
use msf_core::{DispatchError, Invocation, Route};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower::ServiceExt;
use tracing::{debug, error, warn};

use super::backend::QueueBackend;
use super::consumer::MessageHandler;
use crate::service::DispatchPipeline;

pub const QUEUE_MESSAGES_TOTAL: &str = "msf_queue_messages_total";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub provider: Option<String>,
    pub request: Option<Map<String, Value>>,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Builds the invocation, using `fallback` when no provider is given.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidRoute`] when the provider is not a
    /// route and no fallback applies.
    pub fn invocation(&self, fallback: Option<&Route>) -> Result<Invocation, DispatchError> {
        let route = match (self.provider.as_deref(), fallback) {
            (Some(provider), _) => Route::parse(provider)?,
            (None, Some(route)) => route.clone(),
            (None, None) => {
                return Err(DispatchError::InvalidRoute {
                    path: String::new(),
                })
            }
        };
        let params = self
            .params
            .iter()
            .map(|(name, value)| {
                let raw = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), raw)
            })
            .collect();
        Ok(Invocation {
            route,
            body: self.request.clone(),
            params,
        })
    }
}

/// Reply pushed to `replyTo`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decodes envelopes and runs them through the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct EnvelopeHandler {
    pipeline: DispatchPipeline,
    route: Option<Route>,
}

impl EnvelopeHandler {
    #[must_use]
    pub fn new(pipeline: DispatchPipeline, route: Option<Route>) -> Self {
        Self { pipeline, route }
    }

    async fn reply(&self, connection: &dyn QueueBackend, queue: &str, reply: &Reply) {
        let payload = match serde_json::to_vec(reply) {
            Ok(payload) => payload,
            Err(err) => {
                error!(queue, error = %err, "cannot encode reply");
                return;
            }
        };
        if let Err(err) = connection.push(queue, Bytes::from(payload)).await {
            warn!(queue, error = %err, "cannot push reply");
        }
    }
}

#[async_trait]
impl MessageHandler for EnvelopeHandler {
    async fn handle(&self, message: Bytes, connection: &dyn QueueBackend) {
        let envelope: Envelope = match serde_json::from_slice(&message) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, "discarding message: invalid JSON envelope");
                metrics::counter!(QUEUE_MESSAGES_TOTAL, "outcome" => "discarded").increment(1);
                return;
            }
        };
        let invocation = match envelope.invocation(self.route.as_ref()) {
            Ok(invocation) => invocation,
            Err(err) => {
                error!(error = %err, "discarding message: no usable route");
                metrics::counter!(QUEUE_MESSAGES_TOTAL, "outcome" => "discarded").increment(1);
                return;
            }
        };

        let provider = invocation.route.to_string();
        let result = self.pipeline.clone().oneshot(invocation).await;
        let reply = match result {
            Ok(response) => {
                metrics::counter!(QUEUE_MESSAGES_TOTAL, "outcome" => "ok").increment(1);
                Reply {
                    provider,
                    response: Some(response),
                    error: None,
                }
            }
            Err(err) => {
                metrics::counter!(QUEUE_MESSAGES_TOTAL, "outcome" => "error").increment(1);
                if err.is_client_error() {
                    debug!(provider = %provider, error = %err, "queued invocation rejected");
                } else {
                    error!(provider = %provider, error = %err, "queued invocation failed");
                }
                Reply {
                    provider,
                    response: None,
                    error: Some(err.to_string()),
                }
            }
        };

        if let Some(queue) = envelope.reply_to.as_deref().filter(|q| !q.is_empty()) {
            self.reply(connection, queue, &reply).await;
        }
    }
}
