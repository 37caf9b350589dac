//! Pipeline composition: the dispatch service wrapped in its middleware.

use std::sync::Arc;

use msf_core::Dispatcher;
use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use crate::service::dispatch::DispatchService;

/// The service every listener invokes. Cheap to clone.
pub type DispatchPipeline = MetricsService<DispatchService>;

/// Wraps the dispatcher with the invocation middleware.
///
/// Only the metrics layer applies: operations have no timeout and
/// concurrency is bounded by each listener.
#[must_use]
pub fn build_dispatch_pipeline(dispatcher: Arc<Dispatcher>) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .service(DispatchService::new(dispatcher))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
