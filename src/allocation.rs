use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    bookkeeper::RateLimitOverride,
    config::ModelConfig,
    model_limiter::ModelLimiter,
};

/// This instance's share of one model's fleet capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelAllocation {
    /// Events this instance may schedule for the model.
    pub total_slots: u64,
    /// Per-instance tokens-per-minute limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
    /// Per-instance tokens-per-day limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_day: Option<u64>,
    /// Per-instance requests-per-minute limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    /// Per-instance requests-per-day limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
    /// Per-instance in-flight ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u64>,
}

/// Capacity snapshot published by the coordinator for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Allocation {
    /// Live instances the capacity is split across.
    pub instance_count: usize,
    /// Per-model shares, keyed by model id.
    pub per_model: HashMap<String, ModelAllocation>,
    /// Limits overriding the declared ceilings to reflect fleet state,
    /// taking precedence over the computed per-instance shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_limits: Option<HashMap<String, RateLimitOverride>>,
}

impl Allocation {
    /// Total slots this instance may schedule across all models.
    pub fn total_slots(&self) -> u64 {
        self.per_model.values().map(|m| m.total_slots).sum()
    }
}

/// One allocation push from the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationUpdate {
    /// The new allocation.
    pub allocation: Allocation,
    /// The model the change concerns, or `None` for a global change.
    pub model_id: Option<String>,
}

/// Applies allocation updates onto the model limiters.
///
/// Redundant pushes (same instance count, no dynamic limits) are skipped so
/// a chatty coordinator does not thrash counter limits.
#[derive(Debug, Default)]
pub(crate) struct AllocationApplier {
    seen_instance_count: Mutex<Option<usize>>,
}

impl AllocationApplier {
    /// Apply one allocation. Returns whether any limiter was touched.
    pub(crate) fn apply(
        &self,
        allocation: &Allocation,
        limiters: &HashMap<String, std::sync::Arc<ModelLimiter>>,
    ) -> bool {
        {
            let mut seen = self.seen_instance_count.lock();
            if *seen == Some(allocation.instance_count) && allocation.dynamic_limits.is_none() {
                tracing::trace!(
                    instance_count = allocation.instance_count,
                    "allocation unchanged, skipping"
                );
                return false;
            }
            *seen = Some(allocation.instance_count);
        }

        for (model_id, share) in &allocation.per_model {
            let Some(limiter) = limiters.get(model_id) else {
                tracing::warn!(model = %model_id, "allocation for undeclared model ignored");
                continue;
            };
            let limits = self.limits_for(allocation, model_id, share, limiter.config());
            limiter.set_rate_limits(&limits);
        }
        true
    }

    /// The limits to apply for one model: dynamic limits win, then the
    /// share published by the coordinator, then an even split of the
    /// declared ceilings.
    fn limits_for(
        &self,
        allocation: &Allocation,
        model_id: &str,
        share: &ModelAllocation,
        declared: &ModelConfig,
    ) -> RateLimitOverride {
        if let Some(dynamic) = allocation
            .dynamic_limits
            .as_ref()
            .and_then(|limits| limits.get(model_id))
        {
            return *dynamic;
        }

        let provided = RateLimitOverride {
            requests_per_minute: share.requests_per_minute,
            requests_per_day: share.requests_per_day,
            tokens_per_minute: share.tokens_per_minute,
            tokens_per_day: share.tokens_per_day,
            max_concurrent_requests: share.max_concurrent_requests,
        };
        if !provided.is_empty() {
            return provided;
        }

        // The coordinator published only a slot count: fall back to an
        // even split of the declared ceilings.
        let count =
            u64::try_from(allocation.instance_count.max(1)).expect("instance count fits in u64");
        RateLimitOverride {
            requests_per_minute: declared.rpm.map(|limit| limit / count),
            requests_per_day: declared.rpd.map(|limit| limit / count),
            tokens_per_minute: declared.tpm.map(|limit| limit / count),
            tokens_per_day: declared.tpd.map(|limit| limit / count),
            max_concurrent_requests: declared.max_concurrent_requests.map(|limit| limit / count),
        }
    }
}
