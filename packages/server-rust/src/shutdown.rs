//! Process-wide stop signal with in-flight tracking.
//!
//! The signal is a `watch` channel whose value survives without receivers,
//! so a trigger raised before anyone subscribes is still observed. An atomic
//! counter with RAII guards lets push listeners drain in-flight invocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Coordinates shutdown between the signal handler, the active listener and
/// its workers.
///
/// 1. Workers and servers wait on `shutdown_receiver()` or `signalled()`
/// 2. `trigger_shutdown()` raises the signal and wakes every receiver
/// 3. `wait_for_drain()` waits until in-flight invocations complete
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a receiver that observes `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Raises the stop signal. Idempotent.
    pub fn trigger_shutdown(&self) {
        // Stores the value even when no receiver is alive.
        self.shutdown_signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn signalled(&self) {
        let mut rx = self.shutdown_signal.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tracks one in-flight invocation until the guard is dropped, including
    /// during unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight invocations to complete, up to `timeout`.
    ///
    /// Returns `false` when the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_without_subscribers_is_kept() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutting_down());

        controller.trigger_shutdown();
        assert!(controller.is_shutting_down());
        assert!(*controller.shutdown_receiver().borrow());

        controller.trigger_shutdown();
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let controller = ShutdownController::new();
        let guard1 = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);
        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn receivers_and_signalled_observe_trigger() {
        let controller = Arc::new(ShutdownController::new());
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.signalled().await })
        };
        controller.trigger_shutdown();

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        waiter.await.unwrap();

        // Already triggered: resolves at once.
        controller.signalled().await;
    }

    #[tokio::test]
    async fn signalled_after_early_trigger_resolves() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), controller.signalled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_with_active_invocation() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.in_flight_count(), 0);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_timeout_reports_held_invocations() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.in_flight_count(), 1);
    }
}
