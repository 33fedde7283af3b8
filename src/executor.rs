use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    allocation::{Allocation, AllocationApplier},
    availability::{self, Availability, AvailabilityTracker, ChangeOrigin},
    bookkeeper::{ActualUsage, EventShape, Reservation},
    config::{JobTypeConfig, LimiterConfig, Pricing},
    coordinator::{AdmissionContext, Coordinator, ReleaseContext},
    counter::epoch_millis,
    error::{BoxError, LimiterError},
    job::{ActiveJobInfo, CompletedJob, JobContext, JobOptions, JobOutcome, JobResult, JobUsage, UsageEntry},
    job_types::JobTypeManager,
    memory::MemoryArbiter,
    model_limiter::{ModelLimiter, UNBOUNDED_MODEL_POOL},
    selector::{default_max_wait, ModelSelector, SelectorProgress},
};

/// Shared state driving admissions: everything the facade owns minus the
/// background tasks.
pub(crate) struct Engine {
    pub(crate) instance_id: String,
    pub(crate) config: LimiterConfig,
    pub(crate) job_type_configs: HashMap<String, JobTypeConfig>,
    /// Limiters in escalation order.
    pub(crate) escalation: Vec<Arc<ModelLimiter>>,
    pub(crate) by_id: HashMap<String, Arc<ModelLimiter>>,
    pub(crate) job_types: JobTypeManager,
    pub(crate) memory: MemoryArbiter,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) tracker: AvailabilityTracker,
    pub(crate) applier: AllocationApplier,
    pub(crate) allocation: Mutex<Option<Allocation>>,
    pub(crate) active: Mutex<HashMap<String, ActiveJobInfo>>,
    pub(crate) completed: Mutex<VecDeque<CompletedJob>>,
}

/// Everything one attempt holds while the user job runs.
struct AttemptResources<'e> {
    engine: &'e Engine,
    limiter: Arc<ModelLimiter>,
    shape: EventShape,
    reservation: Reservation,
    admission: AdmissionContext,
}

impl AttemptResources<'_> {
    /// Refund and return every resource this attempt holds. `actual` is
    /// what the attempt consumed, `None` when it never ran.
    async fn release(self, actual: Option<ActualUsage>) {
        let consumed = actual.unwrap_or_default();
        self.limiter
            .release_reservation(&self.shape, &consumed, &self.reservation);
        self.limiter.release_concurrency();
        self.engine.memory.release(self.limiter.id());

        let context = ReleaseContext {
            admission: self.admission,
            actual_requests: actual.map(|a| a.requests),
            actual_tokens: actual.map(|a| a.tokens),
            window_starts: Some(self.reservation),
        };
        // Release is best-effort: a coordinator outage must not fail the
        // job that already ran.
        if let Err(error) = self.engine.coordinator.release(&context).await {
            tracing::warn!(%error, "coordinator release failed, ignoring");
        }
    }
}

/// Releases the job-type slot and the active-jobs entry on every exit.
struct AdmissionGuard<'e> {
    engine: &'e Engine,
    job_id: String,
    job_type: String,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.engine.job_types.release_slot(&self.job_type);
        self.engine.active.lock().remove(&self.job_id);
    }
}

impl Engine {
    /// The reservation shape of one event for a (job type, model) pair:
    /// the job type's estimates where declared, the model's otherwise.
    pub(crate) fn shape_for(&self, job_type: Option<&str>, model_id: &str) -> EventShape {
        let model = self
            .by_id
            .get(model_id)
            .map(|limiter| limiter.config().resources_per_event)
            .unwrap_or_default();
        let job_type = job_type.and_then(|name| self.job_type_configs.get(name));
        EventShape {
            requests: job_type
                .and_then(|jt| jt.estimated_number_of_requests)
                .unwrap_or(model.estimated_number_of_requests),
            tokens: job_type
                .and_then(|jt| jt.estimated_used_tokens)
                .unwrap_or(model.estimated_used_tokens),
        }
    }

    /// The wait bound for a (job type, model) pair. Unconfigured models
    /// wait into the next minute window.
    fn max_wait_for(&self, job_type: &str, model_id: &str) -> Duration {
        let configured = self
            .job_type_configs
            .get(job_type)
            .and_then(|jt| jt.max_wait_ms.get(model_id));
        match configured {
            Some(ms) => Duration::from_millis(*ms),
            None => default_max_wait(epoch_millis() / 1_000),
        }
    }

    /// Whether any model in the escalation order could admit one event.
    pub(crate) fn has_capacity(&self) -> bool {
        self.escalation
            .iter()
            .any(|limiter| limiter.has_capacity(&self.shape_for(None, limiter.id())))
    }

    pub(crate) fn has_capacity_for_model(&self, model_id: &str) -> Result<bool, LimiterError> {
        let limiter = self
            .by_id
            .get(model_id)
            .ok_or_else(|| LimiterError::UnknownModel(model_id.to_owned()))?;
        Ok(limiter.has_capacity(&self.shape_for(None, model_id)))
    }

    /// Recompute the job-type slot pools from the current allocation (or
    /// local ceilings) and the memory pool.
    pub(crate) fn recompute_pools(&self) {
        let total_slots = match self.allocation.lock().as_ref() {
            Some(allocation) => allocation.total_slots(),
            None => self
                .escalation
                .iter()
                .map(|limiter| {
                    limiter
                        .slot_ceiling(&self.shape_for(None, limiter.id()))
                        .unwrap_or(UNBOUNDED_MODEL_POOL)
                })
                .sum(),
        };
        self.job_types
            .recompute(total_slots, Some(self.memory.capacity_kb()));
    }

    /// Current availability snapshot: local remainders, with slots from
    /// the distributed allocation when one is set.
    pub(crate) fn availability(&self) -> Availability {
        let mut snapshot = availability::derive_local(
            &self.escalation,
            |model_id| self.shape_for(None, model_id),
            &self.memory,
        );
        if let Some(allocation) = self.allocation.lock().as_ref() {
            snapshot.slots = availability::derive_distributed(
                allocation,
                &self.job_type_configs,
                |job_type| self.job_types.ratio_of(job_type).unwrap_or(0.0),
                self.memory.capacity_kb(),
            );
        }
        snapshot
    }

    /// Re-derive availability and emit it when distinct.
    pub(crate) fn emit_change(&self, origin: &ChangeOrigin) {
        self.tracker.emit_if_changed(self.availability(), origin);
    }

    /// Take a coordinator allocation into use: resize the model limiters
    /// to this instance's share, refresh the job-type pools, and re-emit
    /// availability as a `distributed` change.
    pub(crate) fn apply_allocation(&self, allocation: &Allocation, model_id: Option<String>) {
        let applied = self.applier.apply(allocation, &self.by_id);
        *self.allocation.lock() = Some(allocation.clone());
        self.recompute_pools();
        if applied {
            self.emit_change(&ChangeOrigin::Distributed { model_id });
        }
    }

    fn cost_of(pricing: Option<&Pricing>, usage: &JobUsage) -> f64 {
        let Some(pricing) = pricing else {
            return 0.0;
        };
        #[allow(clippy::cast_precision_loss)]
        let line = |tokens: u64, price: f64| tokens as f64 * price / 1e6;
        line(usage.input_tokens, pricing.input)
            + line(usage.cached_tokens, pricing.cached)
            + line(usage.output_tokens, pricing.output)
    }

    fn usage_entry(limiter: &ModelLimiter, usage: &JobUsage) -> UsageEntry {
        UsageEntry {
            model_id: limiter.id().to_owned(),
            input_tokens: usage.input_tokens,
            cached_tokens: usage.cached_tokens,
            output_tokens: usage.output_tokens,
            request_count: usage.request_count,
            cost: Self::cost_of(limiter.config().pricing.as_ref(), usage),
        }
    }

    fn record_completed(&self, summary: CompletedJob) {
        let mut completed = self.completed.lock();
        if completed.len() >= self.config.completed_ring_size {
            completed.pop_front();
        }
        completed.push_back(summary);
    }

    fn mark_tried(&self, job_id: &str, tried: &HashSet<String>) {
        if let Some(info) = self.active.lock().get_mut(job_id) {
            info.tried_models = tried.iter().cloned().collect();
        }
    }

    fn set_model_in_progress(&self, job_id: &str, model_id: Option<&str>) {
        if let Some(info) = self.active.lock().get_mut(job_id) {
            info.model_in_progress = model_id.map(str::to_owned);
        }
    }

    /// Drive one job to completion: select a model, acquire every
    /// resource, run the user future, and release on every path.
    pub(crate) async fn run_job<T, F, Fut>(
        self: &Arc<Self>,
        options: JobOptions,
        mut job: F,
        forced_model: Option<&str>,
    ) -> Result<JobResult<T>, LimiterError>
    where
        F: FnMut(JobContext) -> Fut + Send,
        Fut: Future<Output = Result<JobOutcome<T>, BoxError>> + Send,
        T: Send,
    {
        let job_id = options
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job_type = options.job_type.unwrap_or_else(|| "default".to_owned());
        if !self.job_types.contains(&job_type) {
            return Err(LimiterError::UnknownJobType(job_type));
        }

        let escalation: Vec<Arc<ModelLimiter>> = match forced_model {
            Some(model_id) => {
                let limiter = self
                    .by_id
                    .get(model_id)
                    .ok_or_else(|| LimiterError::UnknownModel(model_id.to_owned()))?;
                vec![limiter.clone()]
            }
            None => self.escalation.clone(),
        };

        // Job-type gate: blocks while this type's allocation is full.
        self.job_types.acquire_slot(&job_type).await?;
        let _guard = AdmissionGuard {
            engine: self.as_ref(),
            job_id: job_id.clone(),
            job_type: job_type.clone(),
        };
        self.active.lock().insert(
            job_id.clone(),
            ActiveJobInfo {
                job_id: job_id.clone(),
                job_type: job_type.clone(),
                model_in_progress: None,
                waiting_on_model: None,
                max_wait_remaining: None,
                tried_models: Vec::new(),
            },
        );

        let mut tried: HashSet<String> = HashSet::new();
        let mut usage_entries: Vec<UsageEntry> = Vec::new();
        let mut attempt: u32 = 0;
        let mut cleared_once = false;

        let outcome = loop {
            let selector = ModelSelector {
                escalation_order: &escalation,
                poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            };
            let selected = selector
                .select(
                    &tried,
                    |limiter| limiter.has_capacity(&self.shape_for(Some(&job_type), limiter.id())),
                    |model_id| self.max_wait_for(&job_type, model_id),
                    |progress| {
                        let mut active = self.active.lock();
                        if let Some(info) = active.get_mut(&job_id) {
                            match progress {
                                SelectorProgress::Waiting {
                                    model_id,
                                    remaining,
                                } => {
                                    info.waiting_on_model = Some(model_id.to_owned());
                                    info.max_wait_remaining = Some(remaining);
                                }
                                SelectorProgress::Idle => {
                                    info.waiting_on_model = None;
                                    info.max_wait_remaining = None;
                                }
                            }
                        }
                    },
                )
                .await;

            let Some(limiter) = selected else {
                // Give window resets and other instances' releases one
                // chance before giving up for good.
                if !tried.is_empty() && !cleared_once {
                    cleared_once = true;
                    tried.clear();
                    self.mark_tried(&job_id, &tried);
                    continue;
                }
                break Err(LimiterError::AllModelsExhausted);
            };

            let shape = self.shape_for(Some(&job_type), limiter.id());
            self.memory.acquire(limiter.id()).await;

            let admission = AdmissionContext {
                instance_id: self.instance_id.clone(),
                model_id: limiter.id().to_owned(),
                job_id: job_id.clone(),
                job_type: job_type.clone(),
                estimated_requests: shape.requests,
                estimated_tokens: shape.tokens,
            };
            match self.coordinator.acquire(&admission).await {
                Ok(true) => {}
                Ok(false) => {
                    self.memory.release(limiter.id());
                    tried.insert(limiter.id().to_owned());
                    self.mark_tried(&job_id, &tried);
                    if tried.len() >= escalation.len() {
                        break Err(LimiterError::AllModelsRejectedByBackend);
                    }
                    continue;
                }
                Err(error) => {
                    self.memory.release(limiter.id());
                    break Err(LimiterError::Coordinator(error));
                }
            }

            let Some(reservation) = limiter.try_reserve(&shape) else {
                // Lost the admission race since selection: give back what
                // this attempt holds and select again.
                let context = ReleaseContext {
                    admission,
                    actual_requests: None,
                    actual_tokens: None,
                    window_starts: None,
                };
                if let Err(error) = self.coordinator.release(&context).await {
                    tracing::warn!(%error, "coordinator release failed, ignoring");
                }
                self.memory.release(limiter.id());
                continue;
            };

            if !limiter.try_acquire_concurrency() {
                limiter.release_reservation(&shape, &ActualUsage::default(), &reservation);
                let context = ReleaseContext {
                    admission,
                    actual_requests: None,
                    actual_tokens: None,
                    window_starts: Some(reservation),
                };
                if let Err(error) = self.coordinator.release(&context).await {
                    tracing::warn!(%error, "coordinator release failed, ignoring");
                }
                self.memory.release(limiter.id());
                continue;
            }

            let resources = AttemptResources {
                engine: self.as_ref(),
                limiter: limiter.clone(),
                shape,
                reservation,
                admission,
            };

            attempt += 1;
            self.set_model_in_progress(&job_id, Some(limiter.id()));
            tracing::debug!(job = %job_id, model = %limiter.id(), attempt, "running job");
            let result = job(JobContext {
                job_id: job_id.clone(),
                job_type: job_type.clone(),
                model_id: limiter.id().to_owned(),
                attempt,
            })
            .await;
            self.set_model_in_progress(&job_id, None);

            match result {
                Ok(JobOutcome::Resolved { value, usage }) => {
                    let actual = ActualUsage {
                        requests: usage.request_count,
                        tokens: usage.total_tokens(),
                    };
                    resources.release(Some(actual)).await;
                    usage_entries.push(Self::usage_entry(&limiter, &usage));
                    self.emit_change(&ChangeOrigin::Mutation {
                        model_id: Some(limiter.id().to_owned()),
                    });
                    break Ok(JobResult {
                        value,
                        model_used: limiter.id().to_owned(),
                        total_cost: usage_entries.iter().map(|u| u.cost).sum(),
                        usage: usage_entries,
                    });
                }
                Ok(JobOutcome::Rejected {
                    usage,
                    delegate: true,
                }) => {
                    let actual = usage.map(|usage| ActualUsage {
                        requests: usage.request_count,
                        tokens: usage.total_tokens(),
                    });
                    resources.release(Some(actual.unwrap_or_default())).await;
                    if let Some(usage) = usage {
                        usage_entries.push(Self::usage_entry(&limiter, &usage));
                    }
                    tried.insert(limiter.id().to_owned());
                    self.mark_tried(&job_id, &tried);
                    self.emit_change(&ChangeOrigin::Mutation {
                        model_id: Some(limiter.id().to_owned()),
                    });
                    tracing::debug!(job = %job_id, model = %limiter.id(), "delegating to next model");
                    continue;
                }
                Ok(JobOutcome::Rejected {
                    usage,
                    delegate: false,
                }) => {
                    let actual = usage.map(|usage| ActualUsage {
                        requests: usage.request_count,
                        tokens: usage.total_tokens(),
                    });
                    resources.release(Some(actual.unwrap_or_default())).await;
                    if let Some(usage) = usage {
                        usage_entries.push(Self::usage_entry(&limiter, &usage));
                    }
                    self.emit_change(&ChangeOrigin::Mutation {
                        model_id: Some(limiter.id().to_owned()),
                    });
                    break Err(LimiterError::JobRejected {
                        job_id: job_id.clone(),
                        total_cost: usage_entries.iter().map(|u| u.cost).sum(),
                        usage: std::mem::take(&mut usage_entries),
                    });
                }
                Err(source) => {
                    // A failed job reports zero actuals: the whole
                    // estimate is refunded, window permitting.
                    resources.release(Some(ActualUsage::default())).await;
                    self.emit_change(&ChangeOrigin::Mutation {
                        model_id: Some(limiter.id().to_owned()),
                    });
                    break Err(LimiterError::JobFailed {
                        job_id: job_id.clone(),
                        total_cost: usage_entries.iter().map(|u| u.cost).sum(),
                        usage: std::mem::take(&mut usage_entries),
                        source,
                    });
                }
            }
        };

        // Hooks and the completed ring see every terminal outcome.
        match &outcome {
            Ok(result) => {
                let summary = CompletedJob {
                    job_id,
                    job_type,
                    model_used: Some(result.model_used.clone()),
                    succeeded: true,
                    total_cost: result.total_cost,
                    usage: result.usage.clone(),
                };
                if let Some(hook) = options.on_complete {
                    hook(&summary);
                }
                self.record_completed(summary);
            }
            Err(error) => {
                let (total_cost, usage) = match error {
                    LimiterError::JobRejected {
                        total_cost, usage, ..
                    }
                    | LimiterError::JobFailed {
                        total_cost, usage, ..
                    } => (*total_cost, usage.clone()),
                    _ => (0.0, Vec::new()),
                };
                let summary = CompletedJob {
                    job_id,
                    job_type,
                    model_used: None,
                    succeeded: false,
                    total_cost,
                    usage,
                };
                if let Some(hook) = options.on_error {
                    hook(&summary);
                }
                self.record_completed(summary);
            }
        }
        outcome
    }
}
