use std::{collections::HashMap, sync::Arc};

use conv::ConvAsUtil;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    allocation::Allocation,
    bookkeeper::EventShape,
    config::JobTypeConfig,
    job_types::RatioAdjustment,
    memory::MemoryArbiter,
    model_limiter::{ModelLimiter, UNBOUNDED_MODEL_POOL},
};

/// How many more events the instance can admit now, with the per-resource
/// remainders the estimate came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    /// Events of the estimated shape admissible right now.
    pub slots: u64,
    /// Tokens left in the minute windows, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
    /// Tokens left in the day windows, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_day: Option<u64>,
    /// Requests left in the minute windows, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    /// Requests left in the day windows, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
    /// Concurrency slots free, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_requests: Option<u64>,
    /// Memory free in the arbiter pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
}

/// Why an availability change fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeReason {
    /// The minute token window moved.
    TokensMinute,
    /// The day token window moved.
    TokensDay,
    /// The minute request window moved.
    RequestsMinute,
    /// The day request window moved.
    RequestsDay,
    /// In-flight concurrency moved.
    ConcurrentRequests,
    /// The memory pool moved.
    Memory,
    /// The coordinator pushed a new allocation.
    Distributed,
    /// The ratio adjustment loop moved a job type's share.
    Adjustment,
}

/// A distinct availability snapshot, delivered to the change handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityChange {
    /// The new snapshot.
    pub availability: Availability,
    /// What caused it.
    pub reason: ChangeReason,
    /// The model the change concerns, when attributable to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// The ratio move, for `adjustment` changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<RatioAdjustment>,
}

/// Handler invoked on every distinct availability snapshot.
pub type AvailabilityHandler = Arc<dyn Fn(&AvailabilityChange) + Send + Sync>;

/// What kind of event produced a candidate snapshot.
#[derive(Debug, Clone)]
pub(crate) enum ChangeOrigin {
    /// Local counter, concurrency or memory movement.
    Mutation { model_id: Option<String> },
    /// A coordinator push.
    Distributed { model_id: Option<String> },
    /// A ratio adjustment.
    Adjustment(RatioAdjustment),
}

/// Coalesces availability snapshots and emits the distinct ones with a
/// reason tag.
pub(crate) struct AvailabilityTracker {
    last: Mutex<Option<Availability>>,
    handler: Option<AvailabilityHandler>,
}

impl std::fmt::Debug for AvailabilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityTracker")
            .field("last", &self.last.lock())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl AvailabilityTracker {
    pub(crate) fn new(handler: Option<AvailabilityHandler>) -> Self {
        Self {
            last: Mutex::new(None),
            handler,
        }
    }

    /// Emit `next` unless it equals the previous snapshot. Returns whether
    /// an emission happened.
    pub(crate) fn emit_if_changed(&self, next: Availability, origin: &ChangeOrigin) -> bool {
        let previous = {
            let mut last = self.last.lock();
            if last.as_ref() == Some(&next) {
                return false;
            }
            last.replace(next.clone())
        };

        let (reason, model_id, adjustment) = match origin {
            ChangeOrigin::Mutation { model_id } => (
                diff_reason(previous.as_ref(), &next),
                model_id.clone(),
                None,
            ),
            ChangeOrigin::Distributed { model_id } => {
                (ChangeReason::Distributed, model_id.clone(), None)
            }
            ChangeOrigin::Adjustment(adjustment) => (
                ChangeReason::Adjustment,
                None,
                Some(adjustment.clone()),
            ),
        };

        if let Some(handler) = &self.handler {
            handler(&AvailabilityChange {
                availability: next,
                reason,
                model_id,
                adjustment,
            });
        }
        true
    }

    /// Emit a caller-supplied snapshot as a `distributed` change without
    /// touching the tracked state.
    pub(crate) fn emit_synthetic(&self, availability: Availability) {
        if let Some(handler) = &self.handler {
            handler(&AvailabilityChange {
                availability,
                reason: ChangeReason::Distributed,
                model_id: None,
                adjustment: None,
            });
        }
    }

    pub(crate) fn last(&self) -> Option<Availability> {
        self.last.lock().clone()
    }
}

/// The reason for a local change: the highest-priority field that moved.
fn diff_reason(previous: Option<&Availability>, next: &Availability) -> ChangeReason {
    let Some(previous) = previous else {
        return ChangeReason::Memory;
    };
    let fields = [
        (
            previous.tokens_per_minute,
            next.tokens_per_minute,
            ChangeReason::TokensMinute,
        ),
        (
            previous.tokens_per_day,
            next.tokens_per_day,
            ChangeReason::TokensDay,
        ),
        (
            previous.requests_per_minute,
            next.requests_per_minute,
            ChangeReason::RequestsMinute,
        ),
        (
            previous.requests_per_day,
            next.requests_per_day,
            ChangeReason::RequestsDay,
        ),
        (
            previous.concurrent_requests,
            next.concurrent_requests,
            ChangeReason::ConcurrentRequests,
        ),
        (previous.memory_kb, next.memory_kb, ChangeReason::Memory),
    ];
    for (before, after, reason) in fields {
        if before != after {
            return reason;
        }
    }
    ChangeReason::Memory
}

/// Availability from purely local capacity: for each model, the minimum
/// across its present dimensions of how many estimated-shape events still
/// fit, summed over models.
pub(crate) fn derive_local(
    limiters: &[Arc<ModelLimiter>],
    shape_for: impl Fn(&str) -> EventShape,
    memory: &MemoryArbiter,
) -> Availability {
    let mut availability = Availability {
        memory_kb: Some(memory.available_kb()),
        ..Availability::default()
    };

    for limiter in limiters {
        let shape = shape_for(limiter.id());
        let stats = limiter.stats();
        let mut model_slots: Option<u64> = None;
        let mut bound = |remaining: u64, per_event: u64| {
            if per_event == 0 {
                return;
            }
            let slots = remaining / per_event;
            model_slots = Some(model_slots.map_or(slots, |s| s.min(slots)));
        };

        if let Some(counter) = stats.counters.tokens_per_minute {
            bound(counter.remaining, shape.tokens);
            *availability.tokens_per_minute.get_or_insert(0) += counter.remaining;
        }
        if let Some(counter) = stats.counters.tokens_per_day {
            bound(counter.remaining, shape.tokens);
            *availability.tokens_per_day.get_or_insert(0) += counter.remaining;
        }
        if let Some(counter) = stats.counters.requests_per_minute {
            bound(counter.remaining, shape.requests);
            *availability.requests_per_minute.get_or_insert(0) += counter.remaining;
        }
        if let Some(counter) = stats.counters.requests_per_day {
            bound(counter.remaining, shape.requests);
            *availability.requests_per_day.get_or_insert(0) += counter.remaining;
        }
        if let Some(concurrency) = stats.concurrency {
            model_slots = Some(
                model_slots.map_or(concurrency.available, |s| s.min(concurrency.available)),
            );
            *availability.concurrent_requests.get_or_insert(0) += concurrency.available;
        }
        let memory_estimate = memory.estimate_for(limiter.id());
        if memory_estimate > 0 {
            let by_memory = memory.available_kb() / memory_estimate;
            model_slots = Some(model_slots.map_or(by_memory, |s| s.min(by_memory)));
        }

        // A model with no limits at all can admit without bound; count it
        // the same way job-type gating does.
        availability.slots += model_slots.unwrap_or(UNBOUNDED_MODEL_POOL);
    }
    availability
}

/// Availability under a distributed allocation: each job type's share of
/// every model pool, scaled down to what its memory share fits, clamped to
/// the configured per-model bounds, summed.
pub(crate) fn derive_distributed(
    allocation: &Allocation,
    job_types: &HashMap<String, JobTypeConfig>,
    current_ratio: impl Fn(&str) -> f64,
    total_memory_kb: u64,
) -> u64 {
    let mut slots = 0u64;
    for (name, config) in job_types {
        let ratio = current_ratio(name);
        let model_share = |total: u64| fractional(total, ratio);

        let distributed: u64 = allocation
            .per_model
            .values()
            .map(|m| model_share(m.total_slots))
            .sum();

        let scale = match config.estimated_used_memory_kb {
            Some(estimate) if estimate > 0 && distributed > 0 => {
                let memory_slots = fractional(total_memory_kb, ratio) / estimate;
                #[allow(clippy::cast_precision_loss)]
                {
                    memory_slots.min(distributed) as f64 / distributed as f64
                }
            }
            _ => 1.0,
        };

        for (model_id, model) in &allocation.per_model {
            let share = model_share(model.total_slots);
            #[allow(clippy::cast_precision_loss)]
            let scaled: u64 = (share as f64 * scale)
                .floor()
                .approx()
                .expect("scaled slots fit in u64");
            let bounds = config.capacity_bounds.get(model_id).copied().unwrap_or_default();
            let clamped = scaled
                .max(bounds.min.unwrap_or(0))
                .min(bounds.max.unwrap_or(u64::MAX));
            slots += clamped;
        }
    }
    slots
}

/// `floor(total * ratio)`.
fn fractional(total: u64, ratio: f64) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let scaled = (total as f64 * ratio).floor();
    scaled.approx().expect("fractional slots fit in u64")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{
        allocation::ModelAllocation,
        config::{CapacityBounds, ModelConfig},
    };

    use super::*;

    const SHAPE: EventShape = EventShape {
        requests: 1,
        tokens: 1_000,
    };

    fn tracked() -> (AvailabilityTracker, Arc<Mutex<Vec<AvailabilityChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = AvailabilityTracker::new(Some(Arc::new(move |change: &AvailabilityChange| {
            sink.lock().push(change.clone());
        })));
        (tracker, seen)
    }

    #[test]
    fn identical_snapshots_are_coalesced() {
        let (tracker, seen) = tracked();
        let snapshot = Availability {
            slots: 5,
            ..Availability::default()
        };
        let origin = ChangeOrigin::Mutation { model_id: None };

        assert!(tracker.emit_if_changed(snapshot.clone(), &origin));
        assert!(!tracker.emit_if_changed(snapshot, &origin));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn reason_prefers_highest_priority_changed_field() {
        let (tracker, seen) = tracked();
        let origin = ChangeOrigin::Mutation { model_id: None };

        tracker.emit_if_changed(
            Availability {
                slots: 5,
                tokens_per_minute: Some(1_000),
                requests_per_minute: Some(10),
                ..Availability::default()
            },
            &origin,
        );
        // Both fields move: tokensMinute outranks requestsMinute.
        tracker.emit_if_changed(
            Availability {
                slots: 4,
                tokens_per_minute: Some(500),
                requests_per_minute: Some(9),
                ..Availability::default()
            },
            &origin,
        );

        let seen = seen.lock();
        assert_eq!(seen[1].reason, ChangeReason::TokensMinute);
    }

    #[test]
    fn distributed_origin_overrides_diffing() {
        let (tracker, seen) = tracked();
        tracker.emit_if_changed(
            Availability {
                slots: 3,
                tokens_per_minute: Some(100),
                ..Availability::default()
            },
            &ChangeOrigin::Distributed {
                model_id: Some("m".into()),
            },
        );

        let seen = seen.lock();
        assert_eq!(seen[0].reason, ChangeReason::Distributed);
        assert_eq!(seen[0].model_id.as_deref(), Some("m"));
    }

    #[test]
    fn adjustment_origin_carries_delta() {
        let (tracker, seen) = tracked();
        tracker.emit_if_changed(
            Availability::default(),
            &ChangeOrigin::Adjustment(RatioAdjustment {
                job_type: "busy".into(),
                delta: 0.05,
            }),
        );

        let seen = seen.lock();
        assert_eq!(seen[0].reason, ChangeReason::Adjustment);
        assert_eq!(seen[0].adjustment.as_ref().unwrap().job_type, "busy");
    }

    #[test]
    fn synthetic_emission_does_not_poison_state() {
        let (tracker, seen) = tracked();
        tracker.emit_synthetic(Availability {
            slots: 99,
            ..Availability::default()
        });
        assert_eq!(tracker.last(), None);
        assert_eq!(seen.lock()[0].reason, ChangeReason::Distributed);
    }

    #[test]
    fn local_slots_bound_by_scarcest_dimension() {
        let limiters = vec![Arc::new(ModelLimiter::new(
            "m",
            ModelConfig {
                rpm: Some(100),
                tpm: Some(5_000),
                ..ModelConfig::default()
            },
        ))];
        let memory = MemoryArbiter::fixed(0, HashMap::new());

        let availability = derive_local(&limiters, |_| SHAPE, &memory);
        // 100 requests, but only 5 token-shaped events.
        assert_eq!(availability.slots, 5);
        assert_eq!(availability.tokens_per_minute, Some(5_000));
        assert_eq!(availability.requests_per_minute, Some(100));
        assert_eq!(availability.tokens_per_day, None);
    }

    #[test]
    fn unbounded_model_contributes_the_unbounded_pool() {
        let limiters = vec![
            Arc::new(ModelLimiter::new("unbounded", ModelConfig::default())),
            Arc::new(ModelLimiter::new(
                "bounded",
                ModelConfig {
                    rpm: Some(3),
                    ..ModelConfig::default()
                },
            )),
        ];
        let memory = MemoryArbiter::fixed(0, HashMap::new());

        let availability = derive_local(&limiters, |_| SHAPE, &memory);
        assert_eq!(
            availability.slots,
            UNBOUNDED_MODEL_POOL + 3,
            "a model with no limits must still be visible as admissible"
        );
    }

    #[test]
    fn local_slots_respect_memory() {
        let mut estimates = HashMap::new();
        estimates.insert("m".to_owned(), 1_024u64);
        let limiters = vec![Arc::new(ModelLimiter::new(
            "m",
            ModelConfig {
                rpm: Some(100),
                ..ModelConfig::default()
            },
        ))];
        let memory = MemoryArbiter::fixed(3_000, estimates);

        let availability = derive_local(&limiters, |_| SHAPE, &memory);
        assert_eq!(availability.slots, 2, "memory fits only two events");
    }

    #[test]
    fn distributed_slots_scale_with_memory_and_clamp() {
        let mut per_model = HashMap::new();
        per_model.insert(
            "m".to_owned(),
            ModelAllocation {
                total_slots: 10,
                ..ModelAllocation::default()
            },
        );
        let allocation = Allocation {
            instance_count: 1,
            per_model,
            dynamic_limits: None,
        };

        let mut job_types = HashMap::new();
        job_types.insert("default".to_owned(), JobTypeConfig {
            estimated_used_memory_kb: Some(1_024),
            ..JobTypeConfig::default()
        });

        // Memory fits 5 of the 10 distributed slots: scale is 0.5.
        let slots = derive_distributed(&allocation, &job_types, |_| 1.0, 5 * 1_024);
        assert_eq!(slots, 5);

        // A min bound lifts the result; a max bound caps it.
        job_types.get_mut("default").unwrap().capacity_bounds.insert(
            "m".to_owned(),
            CapacityBounds {
                min: Some(7),
                max: None,
            },
        );
        assert_eq!(
            derive_distributed(&allocation, &job_types, |_| 1.0, 5 * 1_024),
            7
        );
    }

    #[test]
    fn handler_call_count_is_exact() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tracker = AvailabilityTracker::new(Some(Arc::new(move |_: &AvailabilityChange| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let origin = ChangeOrigin::Mutation { model_id: None };
        for slots in [1u64, 1, 2, 2, 3] {
            tracker.emit_if_changed(
                Availability {
                    slots,
                    ..Availability::default()
                },
                &origin,
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3, "coalesced to distinct snapshots");
    }
}
