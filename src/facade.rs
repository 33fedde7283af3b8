use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    allocation::{Allocation, AllocationApplier},
    availability::{
        Availability, AvailabilityChange, AvailabilityHandler, AvailabilityTracker, ChangeOrigin,
    },
    config::LimiterConfig,
    coordinator::{Coordinator, DeclaredCapacity, DeclaredModelCapacity, NoopCoordinator},
    error::{BoxError, LimiterError},
    executor::Engine,
    job::{ActiveJobInfo, CompletedJob, JobContext, JobOptions, JobOutcome, JobResult},
    job_types::{JobTypeManager, JobTypeStats},
    memory::{MemoryArbiter, MemoryStats},
    model_limiter::{ModelLimiter, ModelStats},
};

/// Full limiter snapshot returned by [`AdmissionLimiter::get_stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    /// Per-model counter and concurrency stats.
    pub models: HashMap<String, ModelStats>,
    /// The shared memory pool.
    pub memory: MemoryStats,
    /// Per-job-type ratios and slot usage.
    pub job_types: HashMap<String, JobTypeStats>,
    /// The most recently finished jobs, oldest first.
    pub recent_jobs: Vec<CompletedJob>,
}

/// Configures an [`AdmissionLimiter`] before it is built.
pub struct Builder {
    config: LimiterConfig,
    coordinator: Arc<dyn Coordinator>,
    handler: Option<AvailabilityHandler>,
}

impl Builder {
    /// Join a fleet through this coordination backend. Without one the
    /// limiter runs on its declared local capacity.
    #[must_use]
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Invoke `handler` on every distinct availability snapshot.
    #[must_use]
    pub fn on_availability_change(
        mut self,
        handler: impl Fn(&AvailabilityChange) + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and build the limiter.
    pub fn build(self) -> Result<AdmissionLimiter, LimiterError> {
        self.config.validate()?;
        let instance_id = self
            .config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let escalation: Vec<Arc<ModelLimiter>> = self
            .config
            .escalation_order
            .iter()
            .map(|model_id| {
                let model = self.config.models[model_id].clone();
                Arc::new(ModelLimiter::new(model_id.clone(), model))
            })
            .collect();
        let by_id: HashMap<String, Arc<ModelLimiter>> = escalation
            .iter()
            .map(|limiter| (limiter.id().to_owned(), limiter.clone()))
            .collect();

        let memory_estimates: HashMap<String, u64> = self
            .config
            .models
            .iter()
            .filter_map(|(model_id, model)| {
                model
                    .resources_per_event
                    .estimated_used_memory_kb
                    .map(|kb| (model_id.clone(), kb))
            })
            .collect();
        let memory = match self.config.memory_capacity_kb {
            Some(capacity) => MemoryArbiter::fixed(capacity, memory_estimates),
            None => MemoryArbiter::from_host(self.config.free_memory_ratio, memory_estimates),
        };

        let job_type_configs = self.config.effective_job_types();
        let job_types = JobTypeManager::new(&job_type_configs);

        let engine = Arc::new(Engine {
            instance_id,
            job_type_configs,
            escalation,
            by_id,
            job_types,
            memory,
            coordinator: self.coordinator,
            tracker: AvailabilityTracker::new(self.handler),
            applier: AllocationApplier::default(),
            allocation: Mutex::new(None),
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            config: self.config,
        });
        engine.recompute_pools();

        Ok(AdmissionLimiter {
            engine,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Multi-model admission control for jobs limited by requests, tokens,
/// concurrency and memory.
///
/// Owns one admission unit per declared model, the job-type slot pools,
/// the shared memory arbiter and the coordinator client. Jobs enter
/// through [`queue_job`](Self::queue_job); everything else is
/// introspection and lifecycle.
pub struct AdmissionLimiter {
    engine: Arc<Engine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLimiter")
            .field("instance_id", &self.engine.instance_id)
            .field("models", &self.engine.config.escalation_order)
            .finish_non_exhaustive()
    }
}

impl AdmissionLimiter {
    /// A limiter on local capacity only, with no availability handler.
    pub fn new(config: LimiterConfig) -> Result<Self, LimiterError> {
        Self::builder(config).build()
    }

    /// Start configuring a limiter.
    pub fn builder(config: LimiterConfig) -> Builder {
        Builder {
            config,
            coordinator: Arc::new(NoopCoordinator),
            handler: None,
        }
    }

    /// This instance's identity in the fleet.
    pub fn instance_id(&self) -> &str {
        &self.engine.instance_id
    }

    /// Register with the coordinator and spawn the background cadences:
    /// allocation subscription, heartbeats, memory recalculation and the
    /// optional ratio adjustment loop.
    pub async fn start(&self) -> Result<(), LimiterError> {
        let engine = &self.engine;
        let declared = DeclaredCapacity {
            per_model: engine
                .escalation
                .iter()
                .map(|limiter| {
                    let config = limiter.config();
                    let shape = engine.shape_for(None, limiter.id());
                    (
                        limiter.id().to_owned(),
                        DeclaredModelCapacity {
                            slots: limiter.slot_ceiling(&shape),
                            requests_per_minute: config.rpm,
                            requests_per_day: config.rpd,
                            tokens_per_minute: config.tpm,
                            tokens_per_day: config.tpd,
                            max_concurrent_requests: config.max_concurrent_requests,
                        },
                    )
                })
                .collect(),
        };

        let registration = engine
            .coordinator
            .register(&engine.instance_id, &declared)
            .await
            .map_err(LimiterError::Coordinator)?;
        tracing::info!(instance = %engine.instance_id, "registered with coordinator");

        if let Some(allocation) = registration.allocation {
            engine.apply_allocation(&allocation, None);
        }

        let mut tasks = self.tasks.lock();
        if let Some(mut updates) = registration.updates {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match updates.recv().await {
                        Ok(update) => {
                            engine.apply_allocation(&update.allocation, update.model_id);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "allocation updates lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        {
            let engine = engine.clone();
            let cadence = Duration::from_millis(engine.config.heartbeat_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(cadence);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    engine.coordinator.heartbeat(&engine.instance_id).await;
                }
            }));
        }

        {
            let engine = engine.clone();
            let cadence = Duration::from_millis(engine.config.memory_recalculation_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(cadence);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if engine.memory.recalculate() {
                        engine.recompute_pools();
                        engine.emit_change(&ChangeOrigin::Mutation { model_id: None });
                    }
                }
            }));
        }

        if let Some(adjustment) = engine.config.ratio_adjustment {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(adjustment.interval_ms));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Some(moved) = engine.job_types.maybe_adjust(&adjustment) {
                        engine.emit_change(&ChangeOrigin::Adjustment(moved));
                    }
                }
            }));
        }

        Ok(())
    }

    /// Unregister from the coordinator and stop the background cadences.
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.engine
            .coordinator
            .unregister(&self.engine.instance_id)
            .await;
        tracing::info!(instance = %self.engine.instance_id, "stopped");
    }

    /// Admit and run one job.
    ///
    /// The job future is invoked once per attempt with the selected model
    /// in its [`JobContext`], and reports how the attempt went by
    /// returning a [`JobOutcome`]. Returning
    /// [`JobOutcome::Rejected`]`{delegate: true}` refunds the attempt and
    /// retries on the next model in the escalation order.
    pub async fn queue_job<T, F, Fut>(
        &self,
        options: JobOptions,
        job: F,
    ) -> Result<JobResult<T>, LimiterError>
    where
        F: FnMut(JobContext) -> Fut + Send,
        Fut: Future<Output = Result<JobOutcome<T>, BoxError>> + Send,
        T: Send,
    {
        self.engine.run_job(options, job, None).await
    }

    /// Admit and run one job on a specific model, bypassing selection.
    pub async fn queue_job_for_model<T, F, Fut>(
        &self,
        model_id: &str,
        options: JobOptions,
        job: F,
    ) -> Result<JobResult<T>, LimiterError>
    where
        F: FnMut(JobContext) -> Fut + Send,
        Fut: Future<Output = Result<JobOutcome<T>, BoxError>> + Send,
        T: Send,
    {
        self.engine.run_job(options, job, Some(model_id)).await
    }

    /// Whether some model in the escalation order could admit one event of
    /// its estimated shape right now.
    pub fn has_capacity(&self) -> bool {
        self.engine.has_capacity()
    }

    /// Whether this model could admit one event of its estimated shape.
    pub fn has_capacity_for_model(&self, model_id: &str) -> Result<bool, LimiterError> {
        self.engine.has_capacity_for_model(model_id)
    }

    /// Counter, concurrency, memory and job-type snapshots.
    pub fn get_stats(&self) -> LimiterStats {
        LimiterStats {
            models: self
                .engine
                .escalation
                .iter()
                .map(|limiter| (limiter.id().to_owned(), limiter.stats()))
                .collect(),
            memory: self.engine.memory.stats(),
            job_types: self.engine.job_types.stats(),
            recent_jobs: self.engine.completed.lock().iter().cloned().collect(),
        }
    }

    /// Stats for one model.
    pub fn get_model_stats(&self, model_id: &str) -> Result<ModelStats, LimiterError> {
        self.engine
            .by_id
            .get(model_id)
            .map(|limiter| limiter.stats())
            .ok_or_else(|| LimiterError::UnknownModel(model_id.to_owned()))
    }

    /// Jobs currently inside [`queue_job`](Self::queue_job).
    pub fn get_active_jobs(&self) -> Vec<ActiveJobInfo> {
        self.engine.active.lock().values().cloned().collect()
    }

    /// The allocation most recently pushed by the coordinator.
    pub fn get_allocation(&self) -> Option<Allocation> {
        self.engine.allocation.lock().clone()
    }

    /// The current availability snapshot.
    pub fn availability(&self) -> Availability {
        self.engine.availability()
    }

    /// Emit a caller-supplied availability snapshot as a `distributed`
    /// change. Local counters are not touched.
    pub fn set_distributed_availability(&self, availability: Availability) {
        self.engine.tracker.emit_synthetic(availability);
    }
}

impl Drop for AdmissionLimiter {
    fn drop(&mut self) {
        // stop() could not have been awaited here; at least stop the
        // cadences so a dropped limiter does not keep heartbeating.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
