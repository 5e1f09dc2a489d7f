//! In-flight counter - ルートごとの同時実行数
//!
//! `try_acquire` が check-and-increment を 1 回の CAS で行い、
//! 返された `InFlightPermit` の drop が decrement を行う。
//! decrement を手で呼ぶ経路は作らない（早期 return・panic・timeout でも必ず解放）。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Number of admitted, still-running requests on one route.
#[derive(Debug)]
pub struct InFlightCounter {
    count: AtomicUsize,
    released: Arc<Notify>,
}

impl InFlightCounter {
    /// `released` is notified on every decrement.
    pub fn new(released: Arc<Notify>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            released,
        }
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at zero.
    pub fn decrement(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.released.notify_waiters();
    }

    /// Increment only if the result stays within `limit`.
    pub fn try_acquire(self: &Arc<Self>, limit: usize) -> Option<InFlightPermit> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| InFlightPermit {
                counter: Arc::clone(self),
            })
    }
}

/// One admitted request. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping the permit immediately releases the in-flight slot"]
pub struct InFlightPermit {
    counter: Arc<InFlightCounter>,
}

impl InFlightPermit {
    pub fn in_flight(&self) -> usize {
        self.counter.current()
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
