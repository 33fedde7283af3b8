use serde::Serialize;
use tokio::sync::Notify;

use crate::{
    bookkeeper::{ActualUsage, CapacityBookkeeper, CountersStats, EventShape, RateLimitOverride, Reservation},
    config::ModelConfig,
    semaphore::Semaphore,
};

/// Slot pool attributed to a model with no declared limits at all. Slot
/// arithmetic (job-type ratio gating, availability) needs some finite
/// count for such a model; this is large enough to never bind in
/// practice.
pub(crate) const UNBOUNDED_MODEL_POOL: u64 = 1 << 20;

/// In-flight snapshot for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStats {
    /// Requests currently executing.
    pub active: u64,
    /// The in-flight ceiling.
    pub limit: u64,
    /// Slots available right now.
    pub available: u64,
    /// Queued acquisitions.
    pub waiting: usize,
}

/// Full stats for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    /// Window counters, each present only when the model declares the
    /// corresponding ceiling.
    #[serde(flatten)]
    pub counters: CountersStats,
    /// Concurrency, when the model declares an in-flight ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyStats>,
}

/// Admission unit for one (instance, model) pair: the window counters plus
/// the concurrency semaphore, with a change signal the selector can wait on
/// instead of polling.
#[derive(Debug)]
pub(crate) struct ModelLimiter {
    id: String,
    config: ModelConfig,
    bookkeeper: CapacityBookkeeper,
    concurrency: Option<Semaphore>,
    capacity_freed: Notify,
}

impl ModelLimiter {
    pub(crate) fn new(id: impl Into<String>, config: ModelConfig) -> Self {
        let id = id.into();
        let bookkeeper = CapacityBookkeeper::new(&id, &config);
        let concurrency = config.max_concurrent_requests.map(Semaphore::new);
        Self {
            id,
            config,
            bookkeeper,
            concurrency,
            capacity_freed: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Whether one event of this shape could be admitted right now: every
    /// present counter has room and a concurrency slot is free.
    pub(crate) fn has_capacity(&self, shape: &EventShape) -> bool {
        let concurrency_free = self
            .concurrency
            .as_ref()
            .map_or(true, |semaphore| semaphore.available() >= 1);
        concurrency_free && self.bookkeeper.has_capacity_for(shape)
    }

    /// Charge the counters for one event, all-or-nothing.
    pub(crate) fn try_reserve(&self, shape: &EventShape) -> Option<Reservation> {
        self.bookkeeper.try_reserve(shape)
    }

    /// Refund the unused part of a reservation and signal waiters.
    pub(crate) fn release_reservation(
        &self,
        shape: &EventShape,
        actual: &ActualUsage,
        reservation: &Reservation,
    ) {
        self.bookkeeper.release(shape, actual, reservation);
        self.capacity_freed.notify_waiters();
    }

    /// Take one concurrency slot without waiting. Always succeeds when the
    /// model has no in-flight ceiling.
    pub(crate) fn try_acquire_concurrency(&self) -> bool {
        self.concurrency
            .as_ref()
            .map_or(true, |semaphore| semaphore.try_acquire(1))
    }

    pub(crate) fn release_concurrency(&self) {
        if let Some(semaphore) = self.concurrency.as_ref() {
            semaphore.release(1);
        }
        self.capacity_freed.notify_waiters();
    }

    /// Wait until some capacity on this model is released or its limits are
    /// raised. Window rollovers do not fire this signal, so waiters must
    /// still re-check on a deadline.
    pub(crate) async fn capacity_freed(&self) {
        self.capacity_freed.notified().await;
    }

    /// Apply this instance's share of the fleet capacity. Absent fields are
    /// left untouched.
    pub(crate) fn set_rate_limits(&self, limits: &RateLimitOverride) {
        if limits.is_empty() {
            return;
        }
        tracing::debug!(model = %self.id, ?limits, "applying rate limits");
        self.bookkeeper.set_limits(limits);
        if let (Some(semaphore), Some(max)) =
            (self.concurrency.as_ref(), limits.max_concurrent_requests)
        {
            semaphore.set_max(max);
        }
        self.capacity_freed.notify_waiters();
    }

    pub(crate) fn stats(&self) -> ModelStats {
        ModelStats {
            counters: self.bookkeeper.stats(),
            concurrency: self.concurrency.as_ref().map(|semaphore| {
                let stats = semaphore.stats();
                ConcurrencyStats {
                    active: stats.in_use,
                    limit: stats.max,
                    available: stats.available,
                    waiting: stats.waiting,
                }
            }),
        }
    }

    /// Events of this shape the model could admit with all windows empty,
    /// bounded by the concurrency ceiling. `None` means unbounded.
    pub(crate) fn slot_ceiling(&self, shape: &EventShape) -> Option<u64> {
        let from_counters = self.bookkeeper.slot_ceiling(shape);
        let from_concurrency = self.concurrency.as_ref().map(Semaphore::max);
        match (from_counters, from_concurrency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}
