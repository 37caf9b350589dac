//! Turns HTTP requests into invocations.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http::{StatusCode, Uri};
use msf_core::{DispatchError, Invocation, Route};
use serde_json::{Map, Value};
use tower::ServiceExt;

use crate::service::DispatchPipeline;
use crate::shutdown::ShutdownController;

#[derive(Clone)]
pub struct RestState {
    pub pipeline: DispatchPipeline,
    pub shutdown: Arc<ShutdownController>,
}

/// Handles `/<domain...>/<operation>` with an optional JSON object body and
/// query parameters.
pub async fn invoke_handler(
    State(state): State<RestState>,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();

    let invocation = match build_invocation(uri.path(), params, &body) {
        Ok(invocation) => invocation,
        Err(err) => return error_response(&err),
    };

    match state.pipeline.oneshot(invocation).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}

fn build_invocation(
    path: &str,
    params: Vec<(String, String)>,
    body: &[u8],
) -> Result<Invocation, DispatchError> {
    let route = Route::parse(path)?;
    Ok(Invocation {
        route,
        body: decode_body(body)?,
        params,
    })
}

/// An empty body means no body; anything else must be a JSON object.
fn decode_body(body: &[u8]) -> Result<Option<Map<String, Value>>, DispatchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(other) => Err(DispatchError::InvalidBody {
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(err) => Err(DispatchError::InvalidBody {
            reason: err.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn error_response(err: &DispatchError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        tracing::error!(error = %err, "invocation failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, err.to_string()).into_response()
}
