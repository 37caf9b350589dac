//! Fixed pool of lease tokens bounding concurrent fetch/dispatch work.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub type LeaseId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("no lease became available in time")]
    Timeout,
    #[error("lease pool is closed")]
    Closed,
}

/// `capacity` tokens shared by every worker of one listener.
///
/// A permit and an id move together: the semaphore bounds how many leases
/// exist, the free list says which ids are unused.
#[derive(Debug)]
pub struct LeasePool {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<LeaseId>>>,
    capacity: usize,
}

impl LeasePool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            free: Arc::new(Mutex::new((0..capacity).rev().collect())),
            capacity,
        }
    }

    /// Waits up to `timeout` for a lease.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Timeout`] when none became free in time,
    /// [`LeaseError::Closed`] once the pool is closed.
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease, LeaseError> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned())
            .await
            .map_err(|_| LeaseError::Timeout)?
            .map_err(|_| LeaseError::Closed)?;
        self.lease(permit)
    }

    /// Takes a lease only if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Lease> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.lease(permit).ok()
    }

    fn lease(&self, permit: OwnedSemaphorePermit) -> Result<Lease, LeaseError> {
        let id = self.free.lock().pop().ok_or(LeaseError::Closed)?;
        Ok(Lease {
            id,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }

    /// Rejects all pending and future acquisitions. Held leases stay valid
    /// and still return their id on drop.
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Leases not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub fn held(&self) -> usize {
        self.capacity - self.available()
    }
}

/// A held lease. Dropping it returns the token to the pool.
#[derive(Debug)]
pub struct Lease {
    id: LeaseId,
    free: Arc<Mutex<Vec<LeaseId>>>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    #[must_use]
    pub fn id(&self) -> LeaseId {
        self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The permit is released after this body, so the id is back first.
        self.free.lock().push(self.id);
    }
}
