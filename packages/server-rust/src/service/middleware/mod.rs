//! Tower middleware for the dispatch pipeline.
//!
//! - [`metrics`]: Invocation timing and counting
//! - [`pipeline`]: Composes the layers around the dispatch service

pub mod metrics;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
