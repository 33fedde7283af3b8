use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::{
    allocation::{Allocation, AllocationUpdate, ModelAllocation},
    error::BoxError,
};

use super::{
    AdmissionContext, Coordinator, DeclaredCapacity, DeclaredModelCapacity, Registration,
    ReleaseContext,
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// An in-process fleet coordinator.
///
/// Implements the abstract coordinator wire model directly in memory: a
/// prefixed key-value map with atomic counters for per-instance usage, a
/// broadcast channel for allocation pushes, and heartbeat-based membership
/// with TTL expiry. Useful for multi-limiter processes and as the
/// reference behaviour for networked backends.
///
/// Capacity is split evenly: with `n` live instances each gets
/// `declared / n` of every declared ceiling, so the fleet total stays
/// within the declared capacity (up to flooring).
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    key_prefix: String,
    ttl: Duration,
    state: Mutex<FleetState>,
    updates: broadcast::Sender<AllocationUpdate>,
}

struct FleetState {
    instances: HashMap<String, Instance>,
    /// Usage counters, keyed `{prefix}:usage:{instance}:{model}`. A
    /// BTreeMap so cleanup can scan by key prefix, the way a networked
    /// store would.
    usage: BTreeMap<String, u64>,
    /// Union of the fleet's declared ceilings.
    declared: HashMap<String, DeclaredModelCapacity>,
}

struct Instance {
    last_heartbeat: Instant,
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryCoordinator")
            .field("key_prefix", &self.inner.key_prefix)
            .field("instances", &state.instances.len())
            .finish_non_exhaustive()
    }
}

impl MemoryCoordinator {
    /// A coordinator expiring instances whose last heartbeat is older than
    /// `ttl`. The TTL must be strictly longer than the heartbeat cadence
    /// of the participating limiters.
    pub fn new(key_prefix: impl Into<String>, ttl: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                key_prefix: key_prefix.into(),
                ttl,
                state: Mutex::new(FleetState {
                    instances: HashMap::new(),
                    usage: BTreeMap::new(),
                    declared: HashMap::new(),
                }),
                updates,
            }),
        }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.inner.state.lock().instances.len()
    }

    fn usage_key(&self, instance_id: &str, model_id: &str) -> String {
        format!(
            "{}:usage:{instance_id}:{model_id}",
            self.inner.key_prefix
        )
    }

    /// Drop instances whose heartbeat has gone stale, scanning their usage
    /// counters away by key prefix. Returns whether membership changed.
    fn expire_stale(&self, state: &mut FleetState, now: Instant) -> bool {
        let ttl = self.inner.ttl;
        let stale: Vec<String> = state
            .instances
            .iter()
            .filter(|(_, instance)| now.duration_since(instance.last_heartbeat) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for instance_id in &stale {
            tracing::warn!(instance = %instance_id, "instance heartbeat expired");
            state.instances.remove(instance_id);
            self.scrub_usage(state, instance_id);
        }
        !stale.is_empty()
    }

    fn scrub_usage(&self, state: &mut FleetState, instance_id: &str) {
        let prefix = format!("{}:usage:{instance_id}:", self.inner.key_prefix);
        let doomed: Vec<String> = state
            .usage
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            state.usage.remove(&key);
        }
    }

    /// The allocation every live instance currently gets.
    fn allocation(&self, state: &FleetState) -> Allocation {
        let count = state.instances.len();
        let divisor = u64::try_from(count.max(1)).expect("instance count fits in u64");
        let per_model = state
            .declared
            .iter()
            .map(|(model_id, declared)| {
                (
                    model_id.clone(),
                    ModelAllocation {
                        total_slots: declared.slots.map_or(0, |slots| slots / divisor),
                        tokens_per_minute: declared.tokens_per_minute.map(|v| v / divisor),
                        tokens_per_day: declared.tokens_per_day.map(|v| v / divisor),
                        requests_per_minute: declared.requests_per_minute.map(|v| v / divisor),
                        requests_per_day: declared.requests_per_day.map(|v| v / divisor),
                        max_concurrent_requests: declared
                            .max_concurrent_requests
                            .map(|v| v / divisor),
                    },
                )
            })
            .collect();
        Allocation {
            instance_count: count,
            per_model,
            dynamic_limits: None,
        }
    }

    fn publish(&self, state: &FleetState) {
        let update = AllocationUpdate {
            allocation: self.allocation(state),
            model_id: None,
        };
        // No receivers is fine: instances may not have subscribed yet.
        let _ = self.inner.updates.send(update);
    }

    /// This instance's slot share for one model, `None` when unlimited.
    fn share(&self, state: &FleetState, model_id: &str) -> Option<u64> {
        let declared = state.declared.get(model_id)?;
        let slots = declared.slots?;
        let divisor =
            u64::try_from(state.instances.len().max(1)).expect("instance count fits in u64");
        Some(slots / divisor)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn register(
        &self,
        instance_id: &str,
        declared: &DeclaredCapacity,
    ) -> Result<Registration, BoxError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        self.expire_stale(&mut state, now);

        state.instances.insert(
            instance_id.to_owned(),
            Instance {
                last_heartbeat: now,
            },
        );
        // Merge by max: instances sharing one upstream account declare the
        // same ceilings, and the fleet must not exceed the largest claim.
        for (model_id, capacity) in &declared.per_model {
            let merged = state.declared.entry(model_id.clone()).or_default();
            merged.slots = merged.slots.max(capacity.slots);
            merged.requests_per_minute = merged.requests_per_minute.max(capacity.requests_per_minute);
            merged.requests_per_day = merged.requests_per_day.max(capacity.requests_per_day);
            merged.tokens_per_minute = merged.tokens_per_minute.max(capacity.tokens_per_minute);
            merged.tokens_per_day = merged.tokens_per_day.max(capacity.tokens_per_day);
            merged.max_concurrent_requests = merged
                .max_concurrent_requests
                .max(capacity.max_concurrent_requests);
        }

        tracing::debug!(
            instance = %instance_id,
            instances = state.instances.len(),
            "instance registered"
        );
        self.publish(&state);
        Ok(Registration {
            allocation: Some(self.allocation(&state)),
            updates: Some(self.inner.updates.subscribe()),
        })
    }

    async fn acquire(&self, context: &AdmissionContext) -> Result<bool, BoxError> {
        let mut state = self.inner.state.lock();
        if self.expire_stale(&mut state, Instant::now()) {
            self.publish(&state);
        }

        let Some(share) = self.share(&state, &context.model_id) else {
            return Ok(true);
        };
        let key = self.usage_key(&context.instance_id, &context.model_id);
        let in_flight = state.usage.get(&key).copied().unwrap_or(0);
        if in_flight >= share {
            tracing::trace!(
                instance = %context.instance_id,
                model = %context.model_id,
                in_flight,
                share,
                "distributed admission rejected"
            );
            return Ok(false);
        }
        state.usage.insert(key, in_flight + 1);
        Ok(true)
    }

    async fn release(&self, context: &ReleaseContext) -> Result<(), BoxError> {
        let mut state = self.inner.state.lock();
        let key = self.usage_key(
            &context.admission.instance_id,
            &context.admission.model_id,
        );
        if let Some(count) = state.usage.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.last_heartbeat = now;
        }
        if self.expire_stale(&mut state, now) {
            self.publish(&state);
        }
    }

    async fn unregister(&self, instance_id: &str) {
        let mut state = self.inner.state.lock();
        if state.instances.remove(instance_id).is_none() {
            return;
        }
        self.scrub_usage(&mut state, instance_id);
        tracing::debug!(
            instance = %instance_id,
            instances = state.instances.len(),
            "instance unregistered"
        );
        self.publish(&state);
    }
}
