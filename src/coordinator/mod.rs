//! Fleet coordination.
//!
//! The core treats the coordinator as an interface: register this instance
//! and receive capacity allocations, ask for distributed admission before
//! running a job, report usage on release, and heartbeat so stale
//! instances can be expired. Without a coordinator every instance runs on
//! its declared local capacity.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    allocation::{Allocation, AllocationUpdate},
    bookkeeper::Reservation,
    error::BoxError,
};

pub use memory::MemoryCoordinator;

/// Declared per-model capacity an instance brings to the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeclaredModelCapacity {
    /// Events the model could admit with all windows empty.
    pub slots: Option<u64>,
    /// Declared requests-per-minute ceiling.
    pub requests_per_minute: Option<u64>,
    /// Declared requests-per-day ceiling.
    pub requests_per_day: Option<u64>,
    /// Declared tokens-per-minute ceiling.
    pub tokens_per_minute: Option<u64>,
    /// Declared tokens-per-day ceiling.
    pub tokens_per_day: Option<u64>,
    /// Declared in-flight ceiling.
    pub max_concurrent_requests: Option<u64>,
}

/// Everything an instance declares when registering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredCapacity {
    /// Per-model declared capacity, keyed by model id.
    pub per_model: HashMap<String, DeclaredModelCapacity>,
}

/// What a successful registration hands back.
#[derive(Debug)]
pub struct Registration {
    /// The instance's starting allocation, when the coordinator computes
    /// one.
    pub allocation: Option<Allocation>,
    /// Stream of allocation pushes. Dropping the receiver unsubscribes.
    pub updates: Option<broadcast::Receiver<AllocationUpdate>>,
}

/// Identifies one admission attempt to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionContext {
    /// The asking instance.
    pub instance_id: String,
    /// The model the attempt would run on.
    pub model_id: String,
    /// Caller-facing job id.
    pub job_id: String,
    /// The job type admission runs under.
    pub job_type: String,
    /// Requests the attempt will reserve.
    pub estimated_requests: u64,
    /// Tokens the attempt will reserve.
    pub estimated_tokens: u64,
}

/// Reported when an attempt releases its distributed admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseContext {
    /// The admission being released.
    #[serde(flatten)]
    pub admission: AdmissionContext,
    /// Requests actually issued, absent when the attempt never ran.
    pub actual_requests: Option<u64>,
    /// Tokens actually consumed, absent when the attempt never ran.
    pub actual_tokens: Option<u64>,
    /// Window boundaries of the local reservation, for window-aware
    /// accounting on the coordinator side.
    pub window_starts: Option<Reservation>,
}

/// A fleet coordination backend.
///
/// Conceptually a shared key-value store with atomic counters and a
/// publish/subscribe channel; the core only sees this interface.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Join the fleet. The returned registration carries the instance's
    /// starting allocation and a stream of future pushes.
    async fn register(
        &self,
        instance_id: &str,
        declared: &DeclaredCapacity,
    ) -> Result<Registration, BoxError>;

    /// Distributed admission check. `false` forces delegation to the next
    /// model in the escalation order.
    async fn acquire(&self, context: &AdmissionContext) -> Result<bool, BoxError>;

    /// Report usage for a finished (or aborted) attempt. Best-effort:
    /// callers swallow errors.
    async fn release(&self, context: &ReleaseContext) -> Result<(), BoxError>;

    /// Liveness signal. The coordinator expires instances whose heartbeat
    /// is older than its TTL.
    async fn heartbeat(&self, instance_id: &str);

    /// Leave the fleet, returning this instance's share to the others.
    async fn unregister(&self, instance_id: &str);
}

/// The coordinator used when none is configured: every instance runs on
/// its local capacity and distributed admission always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCoordinator;

#[async_trait]
impl Coordinator for NoopCoordinator {
    async fn register(
        &self,
        _instance_id: &str,
        _declared: &DeclaredCapacity,
    ) -> Result<Registration, BoxError> {
        Ok(Registration {
            allocation: None,
            updates: None,
        })
    }

    async fn acquire(&self, _context: &AdmissionContext) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn release(&self, _context: &ReleaseContext) -> Result<(), BoxError> {
        Ok(())
    }

    async fn heartbeat(&self, _instance_id: &str) {}

    async fn unregister(&self, _instance_id: &str) {}
}
