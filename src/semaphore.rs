use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

/// A counting semaphore with FIFO waiters and a resizable maximum.
///
/// Unlike `tokio::sync::Semaphore`, the maximum can be lowered at runtime:
/// when `in_use` exceeds the new maximum, acquisition stalls until releases
/// bring usage back under it. No permits are forcibly revoked.
///
/// Waiters are strictly FIFO: a large waiter at the head of the queue is not
/// overtaken by smaller ones behind it.
#[derive(Debug)]
pub(crate) struct Semaphore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    in_use: u64,
    max: u64,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    n: u64,
    tx: oneshot::Sender<()>,
}

/// Point-in-time snapshot of a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreStats {
    /// Units currently held.
    pub in_use: u64,
    /// The current maximum.
    pub max: u64,
    /// Units which could be acquired right now.
    pub available: u64,
    /// Number of queued waiters.
    pub waiting: usize,
}

impl Semaphore {
    pub(crate) fn new(max: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                in_use: 0,
                max,
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire `n` units, waiting until `in_use + n <= max`.
    ///
    /// Cancel-safe: dropping the returned future either removes the queued
    /// waiter or, if the grant raced the cancellation, returns the units.
    pub(crate) async fn acquire(&self, n: u64) {
        if n == 0 {
            return;
        }
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if inner.waiters.is_empty() && inner.in_use + n <= inner.max {
                inner.in_use += n;
                return;
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter { id, n, tx });
            (id, rx)
        };

        let mut cancel = CancelGuard {
            semaphore: self,
            id,
            n,
            armed: true,
        };
        // The sender is only ever dropped after a successful send, so an
        // Err here cannot leave units granted.
        let _ = rx.await;
        cancel.armed = false;
    }

    /// Acquire `n` units without waiting. Returns false when they are not
    /// immediately available (or when waiters are already queued, to keep
    /// the queue FIFO).
    pub(crate) fn try_acquire(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        let mut inner = self.inner.lock();
        if inner.waiters.is_empty() && inner.in_use + n <= inner.max {
            inner.in_use += n;
            true
        } else {
            false
        }
    }

    /// Return `n` units. Releasing more than is in use clamps at zero.
    pub(crate) fn release(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(n);
        Self::wake(&mut inner);
    }

    /// Change the maximum. Growing wakes eligible waiters; shrinking below
    /// `in_use` makes acquisition wait for releases to drain usage down.
    pub(crate) fn set_max(&self, max: u64) {
        let mut inner = self.inner.lock();
        inner.max = max;
        Self::wake(&mut inner);
    }

    pub(crate) fn max(&self) -> u64 {
        self.inner.lock().max
    }

    pub(crate) fn available(&self) -> u64 {
        let inner = self.inner.lock();
        inner.max.saturating_sub(inner.in_use)
    }

    pub(crate) fn stats(&self) -> SemaphoreStats {
        let inner = self.inner.lock();
        SemaphoreStats {
            in_use: inner.in_use,
            max: inner.max,
            available: inner.max.saturating_sub(inner.in_use),
            waiting: inner.waiters.len(),
        }
    }

    /// Grant queued waiters in FIFO order while capacity allows.
    fn wake(inner: &mut Inner) {
        while let Some(front) = inner.waiters.front() {
            if inner.in_use + front.n > inner.max {
                break;
            }
            let waiter = inner
                .waiters
                .pop_front()
                .expect("front() just returned Some");
            inner.in_use += waiter.n;
            if waiter.tx.send(()).is_err() {
                // Receiver dropped between enqueue and grant.
                inner.in_use -= waiter.n;
            }
        }
    }
}

struct CancelGuard<'s> {
    semaphore: &'s Semaphore,
    id: u64,
    n: u64,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.semaphore.inner.lock();
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == self.id) {
            // Still queued: never granted.
            inner.waiters.remove(pos);
        } else {
            // Granted after the future was dropped: give the units back.
            inner.in_use = inner.in_use.saturating_sub(self.n);
        }
        Semaphore::wake(&mut inner);
    }
}
