//! The dispatcher as a Tower service.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use msf_core::{DispatchError, Dispatcher, Invocation};
use serde_json::Value;
use tower::Service;

/// Runs each [`Invocation`] through a shared [`Dispatcher`].
///
/// Always ready; operations run inline on the calling task.
#[derive(Debug, Clone)]
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl Service<Invocation> for DispatchService {
    type Response = Value;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let dispatcher = Arc::clone(&self.dispatcher);
        Box::pin(async move { dispatcher.dispatch(&invocation) })
    }
}
