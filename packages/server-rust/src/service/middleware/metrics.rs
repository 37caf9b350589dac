//! Metrics middleware for invocations.
//!
//! Wraps every invocation in a `tracing` span carrying route, duration and
//! outcome, and counts invocations by outcome with the `metrics` facade.
//! No exporter is installed by this crate.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use msf_core::{DispatchError, Invocation};
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

pub const OPERATIONS_TOTAL: &str = "msf_operations_total";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records duration and outcome of each invocation.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = Value, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let route = invocation.route.to_string();

        let span = info_span!(
            "invocation",
            route = %route,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                };

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                metrics::counter!(OPERATIONS_TOTAL, "outcome" => outcome).increment(1);

                match &result {
                    Ok(_) => tracing::debug!(route = %route, duration_ms, "invocation complete"),
                    Err(err) => tracing::debug!(route = %route, duration_ms, error = %err, "invocation failed"),
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use msf_core::{Route, ValidationError};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    /// Answers `ok` routes, rejects everything else.
    struct StubService;

    impl Service<Invocation> for StubService {
        type Response = Value;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, invocation: Invocation) -> Self::Future {
            Box::pin(async move {
                if invocation.route.operation == "ok" {
                    Ok(json!({"route": invocation.route.to_string()}))
                } else {
                    Err(DispatchError::Validation(ValidationError::new("rejected")))
                }
            })
        }
    }

    #[tokio::test]
    async fn passes_responses_and_errors_through() {
        let svc = MetricsLayer.layer(StubService);
        let ok = svc
            .oneshot(Invocation::new(Route::new("a", "ok")))
            .await
            .unwrap();
        assert_eq!(ok, json!({"route": "/a/ok"}));

        let svc = MetricsLayer.layer(StubService);
        let err = svc
            .oneshot(Invocation::new(Route::new("a", "no")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
