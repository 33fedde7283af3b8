use std::collections::HashMap;
use std::time::Duration;

use conv::ConvAsUtil;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{
    config::{JobTypeConfig, RatioAdjustmentConfig},
    error::LimiterError,
};

const RATIO_SUM_TOLERANCE: f64 = 1e-6;
const DEFAULT_MIN_RATIO: f64 = 0.05;
const DEFAULT_MAX_RATIO: f64 = 0.9;

/// Per-job-type snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypeStats {
    /// Current pool share.
    pub ratio: f64,
    /// Jobs of this type currently admitted.
    pub in_flight: u64,
    /// Slots currently allocated to this type.
    pub allocated_slots: u64,
}

/// A ratio move made by the adjustment loop, reported alongside the
/// `adjustment` availability reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatioAdjustment {
    /// The job type whose ratio grew.
    pub job_type: String,
    /// How much it grew by.
    pub delta: f64,
}

#[derive(Debug)]
struct TypeState {
    initial_ratio: f64,
    current_ratio: f64,
    flexible: bool,
    min_ratio: f64,
    max_ratio: f64,
    min_capacity: u64,
    estimated_memory_kb: Option<u64>,
    in_flight: u64,
    allocated: u64,
    pressured_since: Option<Instant>,
}

#[derive(Debug)]
struct State {
    types: HashMap<String, TypeState>,
    total_slots: u64,
    total_memory_kb: Option<u64>,
}

/// Distributes the instance's slot pool among job types by ratio.
///
/// Fixed ratios never move, which guarantees a floor for their job types
/// no matter how loaded the others are. Flexible ratios may be shifted by
/// the adjustment loop, with the whole set renormalized so ratios always
/// sum to 1.
#[derive(Debug)]
pub(crate) struct JobTypeManager {
    state: Mutex<State>,
    slot_freed: Notify,
}

impl JobTypeManager {
    pub(crate) fn new(configs: &HashMap<String, JobTypeConfig>) -> Self {
        let mut types: HashMap<String, TypeState> = configs
            .iter()
            .map(|(name, config)| {
                let ratio = config.ratio;
                (
                    name.clone(),
                    TypeState {
                        initial_ratio: ratio.initial_value,
                        current_ratio: ratio.initial_value,
                        flexible: ratio.flexible,
                        min_ratio: ratio.min_ratio.unwrap_or(DEFAULT_MIN_RATIO),
                        max_ratio: ratio.max_ratio.unwrap_or(DEFAULT_MAX_RATIO),
                        min_capacity: config.min_job_type_capacity.unwrap_or(0),
                        estimated_memory_kb: config.estimated_used_memory_kb,
                        in_flight: 0,
                        allocated: 0,
                        pressured_since: None,
                    },
                )
            })
            .collect();

        let sum: f64 = types.values().map(|t| t.current_ratio).sum();
        if sum > 0.0 && (sum - 1.0).abs() > RATIO_SUM_TOLERANCE {
            tracing::warn!(sum, "job type ratios do not sum to 1, renormalizing");
            for state in types.values_mut() {
                state.current_ratio /= sum;
                state.initial_ratio /= sum;
            }
        }

        Self {
            state: Mutex::new(State {
                types,
                total_slots: 0,
                total_memory_kb: None,
            }),
            slot_freed: Notify::new(),
        }
    }

    /// Admit one job of this type if its allocation has room.
    pub(crate) fn try_reserve_slot(&self, job_type: &str) -> Result<bool, LimiterError> {
        let mut state = self.state.lock();
        let entry = state
            .types
            .get_mut(job_type)
            .ok_or_else(|| LimiterError::UnknownJobType(job_type.to_owned()))?;
        if entry.in_flight < entry.allocated {
            entry.in_flight += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Admit one job of this type, waiting until its allocation has room.
    pub(crate) async fn acquire_slot(&self, job_type: &str) -> Result<(), LimiterError> {
        loop {
            // Register for the signal before re-checking, so a release
            // landing in between is not missed.
            let mut wait = std::pin::pin!(self.slot_freed.notified());
            wait.as_mut().enable();
            if self.try_reserve_slot(job_type)? {
                return Ok(());
            }
            wait.await;
        }
    }

    pub(crate) fn release_slot(&self, job_type: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.types.get_mut(job_type) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        drop(state);
        self.slot_freed.notify_waiters();
    }

    /// Recompute allocations from a new pool size and memory budget.
    ///
    /// Each type gets `floor(total * ratio)` slots, capped by what its
    /// memory estimate fits into its share of the memory pool, floored at
    /// its configured minimum capacity.
    pub(crate) fn recompute(&self, total_slots: u64, total_memory_kb: Option<u64>) {
        let mut state = self.state.lock();
        state.total_slots = total_slots;
        state.total_memory_kb = total_memory_kb;
        Self::recompute_locked(&mut state);
        drop(state);
        self.slot_freed.notify_waiters();
    }

    fn recompute_locked(state: &mut State) {
        let total_slots = state.total_slots;
        let total_memory_kb = state.total_memory_kb;
        for (name, entry) in &mut state.types {
            let base = fractional_slots(total_slots, entry.current_ratio);
            let by_memory = match (total_memory_kb, entry.estimated_memory_kb) {
                (Some(memory), Some(estimate)) if estimate > 0 => {
                    fractional_slots(memory, entry.current_ratio) / estimate
                }
                _ => base,
            };
            entry.allocated = base.min(by_memory).max(entry.min_capacity);
            tracing::trace!(
                job_type = %name,
                allocated = entry.allocated,
                ratio = entry.current_ratio,
                "job type allocation"
            );
        }
    }

    /// Replace ratios. Fixed types must keep their configured ratio; the
    /// flexible shares are renormalized so the sum of all ratios stays 1.
    pub(crate) fn set_ratios(&self, ratios: &HashMap<String, f64>) -> Result<(), LimiterError> {
        let mut state = self.state.lock();
        for (name, ratio) in ratios {
            let entry = state
                .types
                .get(name)
                .ok_or_else(|| LimiterError::UnknownJobType(name.clone()))?;
            if !entry.flexible && (ratio - entry.current_ratio).abs() > RATIO_SUM_TOLERANCE {
                return Err(LimiterError::InvalidConfig(format!(
                    "job type `{name}` has a fixed ratio"
                )));
            }
            if !(0.0..=1.0).contains(ratio) {
                return Err(LimiterError::InvalidConfig(format!(
                    "ratio {ratio} for job type `{name}` is outside [0, 1]"
                )));
            }
        }
        for (name, ratio) in ratios {
            let entry = state.types.get_mut(name).expect("validated above");
            if entry.flexible {
                entry.current_ratio = *ratio;
            }
        }
        Self::renormalize_flexible(&mut state);
        Self::recompute_locked(&mut state);
        drop(state);
        self.slot_freed.notify_waiters();
        Ok(())
    }

    /// Scale the flexible shares so the total of all ratios is 1 again.
    fn renormalize_flexible(state: &mut State) {
        let fixed_sum: f64 = state
            .types
            .values()
            .filter(|t| !t.flexible)
            .map(|t| t.current_ratio)
            .sum();
        let flexible_sum: f64 = state
            .types
            .values()
            .filter(|t| t.flexible)
            .map(|t| t.current_ratio)
            .sum();
        if flexible_sum <= 0.0 {
            return;
        }
        let budget = (1.0 - fixed_sum).max(0.0);
        let scale = budget / flexible_sum;
        if (scale - 1.0).abs() <= RATIO_SUM_TOLERANCE {
            return;
        }
        for entry in state.types.values_mut() {
            if entry.flexible {
                entry.current_ratio *= scale;
            }
        }
    }

    /// One pass of the ratio adjustment loop.
    ///
    /// A flexible type whose in-flight count has stayed at or above the
    /// pressure threshold of its allocation for the whole observation
    /// window takes `step` ratio from the least-loaded flexible types,
    /// bounded by each type's min/max ratio.
    pub(crate) fn maybe_adjust(&self, config: &RatioAdjustmentConfig) -> Option<RatioAdjustment> {
        let window = Duration::from_millis(config.observation_window_ms);
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut pressured: Option<String> = None;
        for (name, entry) in &mut state.types {
            if !entry.flexible || entry.allocated == 0 {
                entry.pressured_since = None;
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let load = entry.in_flight as f64 / entry.allocated as f64;
            if load >= config.pressure_threshold {
                let since = *entry.pressured_since.get_or_insert(now);
                if now.duration_since(since) >= window
                    && entry.current_ratio < entry.max_ratio
                    && pressured.is_none()
                {
                    pressured = Some(name.clone());
                }
            } else {
                entry.pressured_since = None;
            }
        }

        let target = pressured?;
        let headroom = {
            let entry = &state.types[&target];
            (entry.max_ratio - entry.current_ratio).min(config.step)
        };

        // Take the step from flexible types with the most idle allocation.
        let mut donors: Vec<(String, f64)> = state
            .types
            .iter()
            .filter(|(name, entry)| {
                entry.flexible
                    && *name != &target
                    && entry.current_ratio > entry.min_ratio
                    && entry.in_flight * 2 < entry.allocated.max(1)
            })
            .map(|(name, entry)| (name.clone(), entry.current_ratio - entry.min_ratio))
            .collect();
        donors.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut taken = 0.0;
        for (name, available) in donors {
            if taken >= headroom {
                break;
            }
            let take = available.min(headroom - taken);
            let entry = state.types.get_mut(&name).expect("donor exists");
            entry.current_ratio -= take;
            taken += take;
        }
        if taken <= 0.0 {
            return None;
        }

        let entry = state.types.get_mut(&target).expect("target exists");
        entry.current_ratio += taken;
        entry.pressured_since = None;
        Self::recompute_locked(&mut state);
        drop(state);
        self.slot_freed.notify_waiters();

        tracing::debug!(job_type = %target, delta = taken, "ratio adjusted under pressure");
        Some(RatioAdjustment {
            job_type: target,
            delta: taken,
        })
    }

    pub(crate) fn ratio_of(&self, job_type: &str) -> Option<f64> {
        self.state
            .lock()
            .types
            .get(job_type)
            .map(|t| t.current_ratio)
    }

    pub(crate) fn contains(&self, job_type: &str) -> bool {
        self.state.lock().types.contains_key(job_type)
    }

    pub(crate) fn stats(&self) -> HashMap<String, JobTypeStats> {
        let state = self.state.lock();
        state
            .types
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    JobTypeStats {
                        ratio: entry.current_ratio,
                        in_flight: entry.in_flight,
                        allocated_slots: entry.allocated,
                    },
                )
            })
            .collect()
    }
}

/// `floor(total * ratio)`, clamped into u64.
fn fractional_slots(total: u64, ratio: f64) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let scaled = (total as f64 * ratio).floor();
    scaled.approx().expect("slot count fits in u64")
}
