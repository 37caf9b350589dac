//! Queue backend interface and the in-process broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is unusable; the caller should reconnect.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("queue backend error: {reason}")]
    Backend { reason: String },
}

/// One connection to a queue server.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Pops the oldest item, waiting up to `timeout`. `None` means the queue
    /// stayed empty.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Bytes>, TransportError>;

    async fn push(&self, queue: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// Opens connections to a queue server.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn QueueBackend>, TransportError>;
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// In-process broker with list semantics: push to the head, pop from the tail.
///
/// Failures can be scripted for tests: pops consume queued errors first, and
/// the broker can refuse new connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: DashMap<String, VecDeque<Bytes>>,
    pushed: Notify,
    failures: Mutex<VecDeque<TransportError>>,
    refuse_connections: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose connections all share this broker.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    pub fn push(&self, queue: &str, payload: impl Into<Bytes>) {
        self.inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.into());
        self.inner.pushed.notify_waiters();
    }

    /// Removes and returns every item of `queue`, oldest first.
    #[must_use]
    pub fn drain(&self, queue: &str) -> Vec<Bytes> {
        self.inner
            .queues
            .get_mut(queue)
            .map(|mut items| items.drain(..).rev().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).map_or(0, |items| items.len())
    }

    #[must_use]
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Makes the next pops (on any connection) fail with `errors`, in order.
    pub fn fail_next_pops(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.inner.failures.lock().extend(errors);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    fn try_pop(&self, queue: &str) -> Option<Bytes> {
        self.inner.queues.get_mut(queue).and_then(|mut items| items.pop_back())
    }

    fn scripted_failure(&self) -> Option<TransportError> {
        self.inner.failures.lock().pop_front()
    }
}

/// Connection handle onto a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl QueueBackend for MemoryConnection {
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        if let Some(err) = self.broker.scripted_failure() {
            return Err(err);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let pushed = self.broker.inner.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(item) = self.broker.try_pop(queue) {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push(&self, queue: &str, payload: Bytes) -> Result<(), TransportError> {
        self.broker.push(queue, payload);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl QueueConnector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn QueueBackend>, TransportError> {
        if self.broker.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost {
                reason: format!("{address} refused the connection"),
            });
        }
        debug!(address, "connected to in-process broker");
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connection(broker: &MemoryBroker) -> Arc<dyn QueueBackend> {
        broker.connector().connect("memory").await.unwrap()
    }

    #[tokio::test]
    async fn pops_in_push_order() {
        let broker = MemoryBroker::new();
        broker.push("q", "a");
        broker.push("q", "b");
        let conn = connection(&broker).await;
        assert_eq!(conn.pop("q", Duration::ZERO).await.unwrap(), Some(Bytes::from("a")));
        assert_eq!(conn.pop("q", Duration::ZERO).await.unwrap(), Some(Bytes::from("b")));
        assert_eq!(conn.pop("q", Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker).await;
        let waiter = tokio::spawn(async move { conn.pop("q", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push("q", "late");
        assert_eq!(waiter.await.unwrap().unwrap(), Some(Bytes::from("late")));
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let broker = MemoryBroker::new();
        broker.push("q", "a");
        broker.fail_next_pops([TransportError::Backend {
            reason: "busy".to_string(),
        }]);
        let conn = connection(&broker).await;
        assert!(matches!(
            conn.pop("q", Duration::ZERO).await,
            Err(TransportError::Backend { .. })
        ));
        assert_eq!(conn.pop("q", Duration::ZERO).await.unwrap(), Some(Bytes::from("a")));
    }

    #[tokio::test]
    async fn refused_connections() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        assert!(broker.connector().connect("memory").await.is_err());
        broker.refuse_connections(false);
        assert!(broker.connector().connect("memory").await.is_ok());
    }

    #[test]
    fn drain_returns_oldest_first() {
        let broker = MemoryBroker::new();
        broker.push("q", "a");
        broker.push("q", "b");
        assert_eq!(broker.len("q"), 2);
        assert_eq!(broker.drain("q"), vec![Bytes::from("a"), Bytes::from("b")]);
        assert!(broker.is_empty("q"));
    }
}
