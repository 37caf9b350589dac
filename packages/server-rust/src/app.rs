//! Startup wiring shared by the binary and the integration tests.

use std::future::Future;
use std::sync::Arc;

use msf_core::config::Describe;
use msf_core::{AuditSink, ConfigSet, Dispatcher, Registry, RegistryBuilder, StartupError};
use tracing::{error, info};

use crate::demo;
use crate::listener::queue::backend::QueueConnector;
use crate::listener::queue::QueueCandidate;
use crate::listener::rest::RestCandidate;
use crate::listener::{ListenContext, Listener, ListenerSet, SelectionError};
use crate::service::{build_dispatch_pipeline, DispatchPipeline};
use crate::shutdown::ShutdownController;

/// Registers the bundled operations: the greeters and `config/describe`.
///
/// # Errors
///
/// Returns a [`StartupError`] listing every failed registration.
pub fn build_registry(configs: Arc<ConfigSet>) -> Result<Registry, StartupError> {
    let mut builder = RegistryBuilder::new();
    demo::register(&mut builder);
    builder.register("config", "describe", Describe::new(configs));
    let registry = builder.build()?;
    info!(operations = registry.operation_count(), "operations registered");
    Ok(registry)
}

#[must_use]
pub fn build_pipeline(registry: Registry, audit: Arc<dyn AuditSink>) -> DispatchPipeline {
    build_dispatch_pipeline(Arc::new(Dispatcher::new(Arc::new(registry), audit)))
}

/// Listener candidates in selection order: the queue first, REST second.
///
/// # Errors
///
/// Returns a [`SelectionError`] when a candidate's configuration cannot be
/// registered.
pub fn build_listeners(
    configs: &ConfigSet,
    connector: Arc<dyn QueueConnector>,
) -> Result<ListenerSet, SelectionError> {
    let mut listeners = ListenerSet::new();
    listeners.add(QueueCandidate::new(connector), configs)?;
    listeners.add(RestCandidate, configs)?;
    Ok(listeners)
}

/// Runs `listener` until it ends, raising the stop signal on Ctrl-C.
///
/// # Errors
///
/// Returns the listener's fatal error.
pub async fn run(
    listener: Box<dyn Listener>,
    pipeline: DispatchPipeline,
    shutdown: Arc<ShutdownController>,
) -> anyhow::Result<()> {
    let signals = tokio::spawn(stop_on_interrupt(
        tokio::signal::ctrl_c(),
        Arc::clone(&shutdown),
    ));

    let transport = listener.transport();
    info!(transport, "listener starting");
    let result = listener.listen(ListenContext { pipeline, shutdown }).await;
    signals.abort();
    info!(transport, ok = result.is_ok(), "listener stopped");
    result
}

/// Triggers shutdown when `interrupt` fires. A failure to install the
/// handler is logged and leaves the process running.
async fn stop_on_interrupt<F>(interrupt: F, shutdown: Arc<ShutdownController>)
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = interrupt => match result {
            Ok(()) => {
                info!("interrupt received, shutting down");
                shutdown.trigger_shutdown();
            }
            Err(err) => error!(error = %err, "cannot listen for Ctrl-C"),
        },
        () = shutdown.signalled() => {}
    }
}
