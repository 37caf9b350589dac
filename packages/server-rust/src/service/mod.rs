//! Invocation pipeline shared by all listeners.
//!
//! 1. **Dispatch** (`dispatch`): the core dispatcher as a `tower::Service<Invocation>`
//! 2. **Middleware** (`middleware`): Tower layers wrapped around it

pub mod dispatch;
pub mod middleware;

pub use dispatch::DispatchService;
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
