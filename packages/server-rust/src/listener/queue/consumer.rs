//! Bounded consumption loop for pull-based queues.
//!
//! `N` connection workers share one [`LeasePool`] and one [`MessageBudget`].
//! Each worker cycles through:
//!
//! 1. **Idle**: wait for a lease (logging and retrying on timeout)
//! 2. **Lease held**: reserve one message from the budget, then pop
//! 3. **Dispatching**: hand the message to the [`MessageHandler`] once
//!
//! and returns the lease on every path, because [`Lease`](super::lease::Lease)
//! releases on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::backend::{QueueBackend, QueueConnector, TransportError};
use super::budget::MessageBudget;
use super::lease::{LeaseError, LeasePool};
use crate::shutdown::ShutdownController;

pub const LEASE_WAIT_TIMEOUTS_TOTAL: &str = "msf_lease_wait_timeouts_total";

/// How long an idle worker waits for a lease before logging and retrying.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long one pop waits for a message.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Handler and settings
// ---------------------------------------------------------------------------

/// Receives every fetched message exactly once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `connection` is the worker's own connection, for replies.
    async fn handle(&self, message: Bytes, connection: &dyn QueueBackend);
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub address: String,
    pub queue: String,
    pub workers: usize,
    pub max_concurrent: usize,
    /// Zero or less means unlimited.
    pub limit: i64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub idle_timeout: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("queue connection lost after {attempts} reconnect attempts: {source}")]
    ConnectionLost {
        attempts: u32,
        source: TransportError,
    },
    #[error("consumer worker failed: {reason}")]
    WorkerFailed { reason: String },
}

/// Totals of one consumer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerReport {
    pub fetched: u64,
    pub transport_errors: u64,
    pub reconnects: u64,
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct Consumer {
    shared: Arc<Shared>,
}

struct Shared {
    settings: ConsumerSettings,
    connector: Arc<dyn QueueConnector>,
    handler: Arc<dyn MessageHandler>,
    pool: Arc<LeasePool>,
    budget: MessageBudget,
    shutdown: Arc<ShutdownController>,
    transport_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl Consumer {
    #[must_use]
    pub fn new(
        settings: ConsumerSettings,
        connector: Arc<dyn QueueConnector>,
        handler: Arc<dyn MessageHandler>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        let pool = Arc::new(LeasePool::new(settings.max_concurrent));
        let budget = MessageBudget::new(settings.limit);
        Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                handler,
                pool,
                budget,
                shutdown,
                transport_errors: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn pool(&self) -> Arc<LeasePool> {
        Arc::clone(&self.shared.pool)
    }

    /// Runs all workers until each one ends: budget spent, stop signal, or
    /// a fatal connection error.
    ///
    /// # Errors
    ///
    /// Returns the first fatal worker error. The stop signal has been raised
    /// by then, so the other workers have drained.
    pub async fn run(self) -> Result<ConsumerReport, ConsumerError> {
        let settings = &self.shared.settings;
        info!(
            queue = %settings.queue,
            workers = settings.workers,
            max_concurrent = settings.max_concurrent,
            limit = settings.limit,
            "consumer starting"
        );

        let closer = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.shutdown.signalled().await;
                shared.pool.close();
            })
        };

        let mut workers = JoinSet::new();
        for worker in 0..settings.workers {
            workers.spawn(run_worker(worker, Arc::clone(&self.shared)));
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(ConsumerError::WorkerFailed {
                    reason: err.to_string(),
                })
            });
            if let Err(err) = result {
                error!(error = %err, "consumer worker stopped with a fatal error");
                self.shared.shutdown.trigger_shutdown();
                first_error.get_or_insert(err);
            }
        }
        closer.abort();
        self.shared.pool.close();

        let report = ConsumerReport {
            fetched: self.shared.budget.consumed(),
            transport_errors: self.shared.transport_errors.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        };
        info!(fetched = report.fetched, "consumer stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("settings", &self.shared.settings)
            .field("pool", &self.shared.pool)
            .field("budget", &self.shared.budget)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker(worker: usize, shared: Arc<Shared>) -> Result<(), ConsumerError> {
    let queue = shared.settings.queue.as_str();
    let Some(mut connection) = connect(worker, &shared, None).await? else {
        return Ok(());
    };
    debug!(worker, queue, "worker started");

    loop {
        if shared.shutdown.is_shutting_down() {
            break;
        }

        let lease = tokio::select! {
            () = shared.shutdown.signalled() => break,
            acquired = shared.pool.acquire(shared.settings.idle_timeout) => match acquired {
                Ok(lease) => lease,
                Err(LeaseError::Timeout) => {
                    warn!(worker, queue, "no lease available, still waiting");
                    metrics::counter!(LEASE_WAIT_TIMEOUTS_TOTAL).increment(1);
                    continue;
                }
                Err(LeaseError::Closed) => break,
            },
        };

        let Some(reservation) = shared.budget.reserve() else {
            debug!(worker, queue, "message limit reached");
            break;
        };

        match connection.pop(queue, shared.settings.poll_timeout).await {
            Ok(None) => {}
            Ok(Some(message)) => {
                reservation.commit();
                debug!(worker, lease = lease.id(), bytes = message.len(), "dispatching message");
                shared.handler.handle(message, connection.as_ref()).await;
                drop(lease);
                if shared.budget.exhausted() {
                    debug!(worker, queue, "message limit reached");
                    break;
                }
            }
            Err(TransportError::ConnectionLost { reason }) => {
                drop(reservation);
                drop(lease);
                shared.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, queue, reason = %reason, "queue connection lost, reconnecting");
                let last = TransportError::ConnectionLost { reason };
                match connect(worker, &shared, Some(last)).await? {
                    Some(fresh) => connection = fresh,
                    None => break,
                }
            }
            Err(err) => {
                drop(reservation);
                drop(lease);
                shared.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, queue, error = %err, "pop failed, backing off");
                tokio::select! {
                    () = shared.shutdown.signalled() => break,
                    () = tokio::time::sleep(shared.settings.reconnect_backoff) => {}
                }
            }
        }
    }

    debug!(worker, queue, "worker stopped");
    Ok(())
}

/// Connects, retrying up to `reconnect_attempts` times with jittered
/// exponential backoff. `last` is the error that broke the previous
/// connection; a reconnect skips the immediate first attempt.
///
/// `Ok(None)` means the stop signal arrived while waiting.
async fn connect(
    worker: usize,
    shared: &Shared,
    last: Option<TransportError>,
) -> Result<Option<Arc<dyn QueueBackend>>, ConsumerError> {
    let settings = &shared.settings;
    let reconnecting = last.is_some();
    let attempts = settings.reconnect_attempts;
    let mut last_error = last;

    for attempt in 0..=attempts {
        if attempt > 0 {
            let delay = backoff_delay(settings.reconnect_backoff, attempt);
            tokio::select! {
                () = shared.shutdown.signalled() => return Ok(None),
                () = tokio::time::sleep(delay) => {}
            }
        } else if reconnecting {
            // Losing the connection always waits at least one backoff step.
            continue;
        }
        match shared.connector.connect(&settings.address).await {
            Ok(connection) => {
                if reconnecting {
                    shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(worker, attempt, "queue connection re-established");
                }
                return Ok(Some(connection));
            }
            Err(err) => {
                warn!(worker, attempt, error = %err, "queue connect failed");
                last_error = Some(err);
            }
        }
    }

    Err(ConsumerError::ConnectionLost {
        attempts,
        source: last_error.unwrap_or_else(|| TransportError::ConnectionLost {
            reason: "no connection attempt made".to_string(),
        }),
    })
}

/// `base * 2^(attempt-1)` plus up to 50% jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1 << attempt.saturating_sub(1).min(16));
    #[allow(clippy::cast_possible_truncation)]
    let max_jitter = (exp.as_millis() / 2) as u64;
    let jitter = if max_jitter == 0 {
        0
    } else {
        rand::rng().random_range(0..=max_jitter)
    };
    exp + Duration::from_millis(jitter)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::listener::queue::backend::MemoryBroker;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: Bytes, _connection: &dyn QueueBackend) {
            self.seen.lock().push(message);
        }
    }

    fn settings(workers: usize, max_concurrent: usize, limit: i64) -> ConsumerSettings {
        ConsumerSettings {
            address: "memory".to_string(),
            queue: "jobs".to_string(),
            workers,
            max_concurrent,
            limit,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(5),
            idle_timeout: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(20),
        }
    }

    fn consumer(
        broker: &MemoryBroker,
        settings: ConsumerSettings,
    ) -> (Consumer, Arc<Recorder>, Arc<ShutdownController>) {
        let recorder = Arc::new(Recorder::default());
        let shutdown = Arc::new(ShutdownController::new());
        let consumer = Consumer::new(
            settings,
            Arc::new(broker.connector()),
            recorder.clone(),
            Arc::clone(&shutdown),
        );
        (consumer, recorder, shutdown)
    }

    fn fill(broker: &MemoryBroker, count: usize) {
        for i in 0..count {
            broker.push("jobs", format!("m{i}"));
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn limit_fetches_exactly_that_many() {
        let broker = MemoryBroker::new();
        fill(&broker, 20);
        let (consumer, recorder, _) = consumer(&broker, settings(3, 2, 5));
        let pool = consumer.pool();

        let report = consumer.run().await.unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(recorder.seen.lock().len(), 5);
        assert_eq!(broker.len("jobs"), 15);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn unlimited_runs_until_shutdown() {
        let broker = MemoryBroker::new();
        fill(&broker, 10);
        let (consumer, recorder, shutdown) = consumer(&broker, settings(2, 4, -1));
        let pool = consumer.pool();
        let run = tokio::spawn(consumer.run());

        wait_until(|| recorder.seen.lock().len() == 10).await;
        broker.push("jobs", "late");
        wait_until(|| recorder.seen.lock().len() == 11).await;

        shutdown.trigger_shutdown();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.fetched, 11);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn messages_from_one_worker_keep_queue_order() {
        let broker = MemoryBroker::new();
        fill(&broker, 4);
        let (consumer, recorder, _) = consumer(&broker, settings(1, 1, 4));
        consumer.run().await.unwrap();
        let seen: Vec<_> = recorder.seen.lock().clone();
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn backend_errors_release_lease_and_budget() {
        let broker = MemoryBroker::new();
        fill(&broker, 3);
        broker.fail_next_pops((0..4).map(|i| TransportError::Backend {
            reason: format!("busy {i}"),
        }));
        let (consumer, recorder, _) = consumer(&broker, settings(2, 1, 3));
        let pool = consumer.pool();

        let report = consumer.run().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.transport_errors, 4);
        assert_eq!(recorder.seen.lock().len(), 3);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn connection_loss_reconnects_and_continues() {
        let broker = MemoryBroker::new();
        fill(&broker, 2);
        broker.fail_next_pops([TransportError::ConnectionLost {
            reason: "EOF".to_string(),
        }]);
        let (consumer, recorder, _) = consumer(&broker, settings(1, 1, 2));

        let report = consumer.run().await.unwrap();
        assert_eq!(report.reconnects, 1);
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_reconnects_are_fatal_and_stop_the_others() {
        let broker = MemoryBroker::new();
        broker.fail_next_pops([TransportError::ConnectionLost {
            reason: "EOF".to_string(),
        }]);
        let mut settings = settings(2, 2, -1);
        settings.reconnect_backoff = Duration::from_millis(20);
        let (consumer, _, shutdown) = consumer(&broker, settings);
        let pool = consumer.pool();
        let run = tokio::spawn(consumer.run());

        // Both workers connect first, then the broker goes away.
        tokio::time::sleep(Duration::from_millis(5)).await;
        broker.refuse_connections(true);

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ConsumerError::ConnectionLost { attempts: 3, .. }));
        assert!(shutdown.is_shutting_down());
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let broker = MemoryBroker::new();
        let (consumer, recorder, shutdown) = consumer(&broker, settings(3, 2, -1));
        let run = tokio::spawn(consumer.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.trigger_shutdown();
        let report = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn lease_wait_timeout_is_retried() {
        // One lease, three workers: two are always waiting and time out.
        let broker = MemoryBroker::new();
        fill(&broker, 6);
        let mut settings = settings(3, 1, 6);
        settings.idle_timeout = Duration::from_millis(1);
        let (consumer, recorder, _) = consumer(&broker, settings);
        consumer.run().await.unwrap();
        assert_eq!(recorder.seen.lock().len(), 6);
    }

    #[tokio::test]
    async fn shutdown_before_run_stops_workers() {
        let broker = MemoryBroker::new();
        let (consumer, recorder, shutdown) = consumer(&broker, settings(2, 2, -1));
        shutdown.trigger_shutdown();

        let report = tokio::time::timeout(Duration::from_secs(2), consumer.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert!(recorder.seen.lock().is_empty());
    }

    /// Parks inside `handle` until released.
    #[derive(Default)]
    struct Blocking {
        entered: Notify,
        release: Notify,
        done: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl MessageHandler for Blocking {
        async fn handle(&self, message: Bytes, _connection: &dyn QueueBackend) {
            self.entered.notify_one();
            self.release.notified().await;
            self.done.lock().push(message);
        }
    }

    #[tokio::test]
    async fn shutdown_lets_held_lease_finish() {
        let broker = MemoryBroker::new();
        fill(&broker, 3);
        let handler = Arc::new(Blocking::default());
        let shutdown = Arc::new(ShutdownController::new());
        let consumer = Consumer::new(
            settings(1, 2, -1),
            Arc::new(broker.connector()),
            handler.clone(),
            Arc::clone(&shutdown),
        );
        let pool = consumer.pool();
        let run = tokio::spawn(consumer.run());

        tokio::time::timeout(Duration::from_secs(2), handler.entered.notified())
            .await
            .unwrap();
        assert_eq!(pool.available(), pool.capacity() - 1);

        shutdown.trigger_shutdown();
        handler.release.notify_one();
        let report = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(handler.done.lock().as_slice(), ["m0"]);
        assert_eq!(broker.len("jobs"), 2);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn backend_errors_back_off_before_retrying() {
        let broker = MemoryBroker::new();
        fill(&broker, 1);
        broker.fail_next_pops((0..2).map(|i| TransportError::Backend {
            reason: format!("busy {i}"),
        }));
        let mut settings = settings(1, 1, 1);
        settings.reconnect_backoff = Duration::from_millis(40);
        let (consumer, recorder, _) = consumer(&broker, settings);

        let started = tokio::time::Instant::now();
        let report = consumer.run().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(report.transport_errors, 2);
        assert_eq!(report.reconnects, 0);
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_stops_the_worker() {
        let broker = MemoryBroker::new();
        broker.fail_next_pops([TransportError::Backend {
            reason: "busy".to_string(),
        }]);
        let mut settings = settings(1, 1, -1);
        settings.reconnect_backoff = Duration::from_secs(60);
        let (consumer, _, shutdown) = consumer(&broker, settings);
        let run = tokio::spawn(consumer.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.trigger_shutdown();
        let report = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.transport_errors, 1);
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let base = Duration::from_millis(100);
        for attempt in 1..=4 {
            let exp = base * (1 << (attempt - 1));
            let delay = backoff_delay(base, attempt);
            assert!(delay >= exp && delay <= exp + exp / 2, "attempt {attempt}: {delay:?}");
        }
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::ZERO);
    }
}
