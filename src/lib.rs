//! Multi-model, multi-tenant admission control for workloads whose cost is
//! measured in several resources at once: requests and tokens per minute
//! and per day, in-flight concurrency, and working-set memory.
//!
//! Jobs carry a job type (priority class) and are dispatched to the first
//! model in an escalation order with capacity, waiting up to a per-model
//! bound when none has any. Reservations are charged against wall-clock
//! windows at admission and refunded window-aware on release. A fleet of
//! instances can share global capacity through a [`Coordinator`]; without
//! one, each instance runs on its declared local limits.
//!
//! ```no_run
//! use admission_limiter::{
//!     AdmissionLimiter, JobOptions, JobOutcome, JobUsage, LimiterConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config: LimiterConfig = serde_json::from_str(
//!     r#"{
//!         "escalationOrder": ["fast", "fallback"],
//!         "models": {
//!             "fast": {
//!                 "tpm": 100000,
//!                 "resourcesPerEvent": { "estimatedUsedTokens": 10000 }
//!             },
//!             "fallback": {
//!                 "tpm": 500000,
//!                 "resourcesPerEvent": { "estimatedUsedTokens": 10000 }
//!             }
//!         }
//!     }"#,
//! )?;
//!
//! let limiter = AdmissionLimiter::new(config)?;
//! limiter.start().await?;
//!
//! let result = limiter
//!     .queue_job(JobOptions::with_id("summarize-1"), |context| async move {
//!         // Call the backend `context.model_id` points at...
//!         let _selected = context.model_id;
//!         Ok(JobOutcome::resolved(
//!             "summary",
//!             JobUsage {
//!                 input_tokens: 4_000,
//!                 output_tokens: 2_000,
//!                 ..JobUsage::default()
//!             },
//!         ))
//!     })
//!     .await?;
//! assert_eq!(result.model_used, "fast");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod allocation;
mod availability;
mod bookkeeper;
mod config;
pub mod coordinator;
mod counter;
mod error;
mod executor;
mod facade;
mod job;
mod job_types;
mod memory;
mod model_limiter;
mod selector;
mod semaphore;

pub use allocation::{Allocation, AllocationUpdate, ModelAllocation};
pub use availability::{Availability, AvailabilityChange, AvailabilityHandler, ChangeReason};
pub use bookkeeper::{CountersStats, RateLimitOverride, Reservation};
pub use config::{
    CapacityBounds, JobTypeConfig, LimiterConfig, ModelConfig, Pricing, RatioAdjustmentConfig,
    RatioConfig, ResourceEstimates,
};
pub use coordinator::{Coordinator, MemoryCoordinator, NoopCoordinator};
pub use counter::CounterStats;
pub use error::{BoxError, LimiterError};
pub use facade::{AdmissionLimiter, Builder, LimiterStats};
pub use job::{
    ActiveJobInfo, CompletedJob, JobContext, JobHook, JobOptions, JobOutcome, JobResult, JobUsage,
    UsageEntry,
};
pub use job_types::{JobTypeStats, RatioAdjustment};
pub use memory::MemoryStats;
pub use model_limiter::{ConcurrencyStats, ModelStats};
pub use semaphore::SemaphoreStats;
