//! MSF server: listener selection, REST and queue transports, and the
//! bounded queue consumption loop around the `msf-core` dispatcher.

pub mod app;
pub mod demo;
pub mod listener;
pub mod logging;
pub mod service;
pub mod shutdown;

pub use listener::{ListenContext, Listener, ListenerCandidate, ListenerSet, SelectionError};
pub use logging::{init_logging, LogFormat};
pub use service::{build_dispatch_pipeline, DispatchPipeline};
pub use shutdown::ShutdownController;
