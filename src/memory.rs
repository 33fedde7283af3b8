use std::collections::HashMap;

use conv::ConvAsUtil;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

use crate::semaphore::Semaphore;

/// Memory pool snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// KB currently reserved by executing attempts.
    pub in_use_kb: u64,
    /// Pool size in KB.
    pub capacity_kb: u64,
    /// KB available right now.
    pub available_kb: u64,
    /// Attempts waiting for memory.
    pub waiting: usize,
}

enum Sizing {
    /// Pool follows host free memory, re-probed periodically.
    Host { free_ratio: f64, system: Mutex<System> },
    /// Pool is a fixed size.
    Fixed,
}

/// Process-wide working-set memory arbiter.
///
/// One semaphore shared by every model limiter, sized from a configured
/// fraction of host free memory (or a fixed capacity). Each executing
/// attempt holds its model's estimated working set for the duration of the
/// attempt; models without a memory estimate bypass the arbiter entirely.
///
/// The arbiter is plain state passed around explicitly, so several
/// independent limiters can coexist in one process with separate pools.
pub struct MemoryArbiter {
    semaphore: Semaphore,
    sizing: Sizing,
    estimates: HashMap<String, u64>,
}

impl std::fmt::Debug for MemoryArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArbiter")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryArbiter {
    /// An arbiter sized from the host's currently free memory.
    ///
    /// `estimates` maps model ids to their per-event working set in KB.
    pub(crate) fn from_host(free_ratio: f64, estimates: HashMap<String, u64>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let capacity = scaled_capacity_kb(system.available_memory() / 1024, free_ratio);
        tracing::debug!(capacity_kb = capacity, "memory pool sized from host");
        Self {
            semaphore: Semaphore::new(capacity),
            sizing: Sizing::Host {
                free_ratio,
                system: Mutex::new(system),
            },
            estimates,
        }
    }

    /// An arbiter with a fixed pool size, exempt from recalculation.
    pub(crate) fn fixed(capacity_kb: u64, estimates: HashMap<String, u64>) -> Self {
        Self {
            semaphore: Semaphore::new(capacity_kb),
            sizing: Sizing::Fixed,
            estimates,
        }
    }

    /// Reserve the model's estimated working set, waiting for space.
    /// A no-op for models without a memory estimate.
    pub(crate) async fn acquire(&self, model_id: &str) {
        self.semaphore.acquire(self.estimate_for(model_id)).await;
    }

    /// Return the model's estimated working set.
    pub(crate) fn release(&self, model_id: &str) {
        let estimate = self.estimate_for(model_id);
        if estimate > 0 {
            self.semaphore.release(estimate);
        }
    }

    /// Re-probe host memory and resize the pool when it moved. Returns
    /// whether the pool size changed. Fixed-size pools never change.
    pub(crate) fn recalculate(&self) -> bool {
        let Sizing::Host { free_ratio, system } = &self.sizing else {
            return false;
        };
        let free_kb = {
            let mut system = system.lock();
            system.refresh_memory();
            system.available_memory() / 1024
        };
        let target = scaled_capacity_kb(free_kb, *free_ratio);
        if target == self.semaphore.max() {
            return false;
        }
        tracing::debug!(capacity_kb = target, "memory pool resized");
        self.semaphore.set_max(target);
        true
    }

    /// Total pool size in KB.
    pub(crate) fn capacity_kb(&self) -> u64 {
        self.semaphore.max()
    }

    /// KB available right now.
    pub(crate) fn available_kb(&self) -> u64 {
        self.semaphore.available()
    }

    pub(crate) fn estimate_for(&self, model_id: &str) -> u64 {
        self.estimates.get(model_id).copied().unwrap_or(0)
    }

    pub(crate) fn stats(&self) -> MemoryStats {
        let stats = self.semaphore.stats();
        MemoryStats {
            in_use_kb: stats.in_use,
            capacity_kb: stats.max,
            available_kb: stats.available,
            waiting: stats.waiting,
        }
    }
}

fn scaled_capacity_kb(free_kb: u64, ratio: f64) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let scaled = (free_kb as f64 * ratio).floor();
    scaled.approx().expect("scaled capacity fits in u64")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimates(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs
            .iter()
            .map(|(id, kb)| ((*id).to_owned(), *kb))
            .collect()
    }

    #[tokio::test]
    async fn acquire_consumes_model_estimate() {
        let arbiter = MemoryArbiter::fixed(10_240, estimates(&[("big", 4_096)]));

        arbiter.acquire("big").await;
        assert_eq!(arbiter.stats().in_use_kb, 4_096);

        arbiter.release("big");
        assert_eq!(arbiter.stats().in_use_kb, 0);
    }

    #[tokio::test]
    async fn model_without_estimate_bypasses_pool() {
        let arbiter = MemoryArbiter::fixed(1, estimates(&[]));

        // Must not block even though the pool is tiny.
        arbiter.acquire("unmetered").await;
        assert_eq!(arbiter.stats().in_use_kb, 0);
        arbiter.release("unmetered");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_when_pool_exhausted() {
        let arbiter = std::sync::Arc::new(MemoryArbiter::fixed(
            4_096,
            estimates(&[("big", 4_096)]),
        ));
        arbiter.acquire("big").await;

        let blocked = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter.acquire("big").await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(arbiter.stats().waiting, 1);

        arbiter.release("big");
        tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .expect("release should unblock the waiter")
            .unwrap();
    }

    #[test]
    fn fixed_pool_ignores_recalculation() {
        let arbiter = MemoryArbiter::fixed(2_048, estimates(&[]));
        assert!(!arbiter.recalculate());
        assert_eq!(arbiter.capacity_kb(), 2_048);
    }

    #[test]
    fn scaling_floors() {
        assert_eq!(scaled_capacity_kb(1_001, 0.5), 500);
        assert_eq!(scaled_capacity_kb(0, 0.5), 0);
    }
}
