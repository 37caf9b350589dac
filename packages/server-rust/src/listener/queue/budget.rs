//! Shared message limit across all workers of one listener.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Remaining-message counter. A limit of zero or less means unlimited.
///
/// Workers reserve one unit before fetching and commit it only when a
/// message was actually received, so with limit `L` exactly `L` messages
/// are fetched however many workers compete.
#[derive(Debug)]
pub struct MessageBudget {
    limit: Option<i64>,
    remaining: AtomicI64,
    consumed: AtomicU64,
}

impl MessageBudget {
    #[must_use]
    pub fn new(limit: i64) -> Self {
        let limit = (limit > 0).then_some(limit);
        Self {
            limit,
            remaining: AtomicI64::new(limit.unwrap_or(0)),
            consumed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(-1)
    }

    #[must_use]
    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    /// Reserves one message, or `None` when the limit has been reached.
    #[must_use]
    pub fn reserve(&self) -> Option<Reservation<'_>> {
        if self.limit.is_some() {
            self.remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                    (left > 0).then(|| left - 1)
                })
                .ok()?;
        }
        Some(Reservation {
            budget: self,
            committed: false,
        })
    }

    /// No messages are left and none are reserved.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.limit.is_some() && self.remaining.load(Ordering::Acquire) <= 0
    }

    /// Messages committed so far.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }
}

/// One reserved message. Dropped without [`commit`](Reservation::commit),
/// the unit goes back to the budget.
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a MessageBudget,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self) {
        self.committed = true;
        self.budget.consumed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed && self.budget.limit.is_some() {
            self.budget.remaining.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn limited_budget_counts_commits_only() {
        let budget = MessageBudget::new(2);
        budget.reserve().unwrap().commit();
        drop(budget.reserve().unwrap());
        assert!(!budget.exhausted());

        budget.reserve().unwrap().commit();
        assert!(budget.exhausted());
        assert!(budget.reserve().is_none());
        assert_eq!(budget.consumed(), 2);
    }

    #[test]
    fn outstanding_reservation_blocks_others() {
        let budget = MessageBudget::new(1);
        let held = budget.reserve().unwrap();
        assert!(budget.reserve().is_none());
        drop(held);
        assert!(budget.reserve().is_some());
    }

    #[test]
    fn non_positive_limit_is_unlimited() {
        for limit in [0, -1, -100] {
            let budget = MessageBudget::new(limit);
            assert_eq!(budget.limit(), None);
            for _ in 0..1000 {
                budget.reserve().unwrap().commit();
            }
            assert!(!budget.exhausted());
            assert_eq!(budget.consumed(), 1000);
        }
    }

    #[test]
    fn concurrent_commits_never_exceed_limit() {
        let budget = Arc::new(MessageBudget::new(500));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || {
                    let mut won = 0;
                    while let Some(reservation) = budget.reserve() {
                        reservation.commit();
                        won += 1;
                    }
                    won
                })
            })
            .collect();
        let total: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, 500);
        assert_eq!(budget.consumed(), 500);
    }
}
