//! Fleet coordination scenarios: capacity splitting, allocation pushes and
//! backend-driven delegation.

use std::sync::Arc;
use std::time::Duration;

use admission_limiter::{
    coordinator::{
        AdmissionContext, Coordinator, DeclaredCapacity, Registration, ReleaseContext,
    },
    AdmissionLimiter, BoxError, JobOptions, JobOutcome, JobUsage, LimiterConfig, LimiterError,
};
use async_trait::async_trait;

fn config(instance_id: &str) -> LimiterConfig {
    serde_json::from_value(serde_json::json!({
        "instanceId": instance_id,
        "escalationOrder": ["shared"],
        "models": {
            "shared": {
                "tpm": 100_000,
                "maxConcurrentRequests": 8,
                "resourcesPerEvent": { "estimatedUsedTokens": 10_000 }
            }
        },
        "memoryCapacityKb": 0,
        "heartbeatIntervalMs": 1_000
    }))
    .expect("test config should parse")
}

/// Two instances sharing one coordinator each end up with half of the
/// declared per-minute budget.
#[tokio::test(start_paused = true)]
async fn fleet_splits_declared_capacity() {
    let coordinator = Arc::new(admission_limiter::MemoryCoordinator::new(
        "fleet",
        Duration::from_secs(30),
    ));

    let first = AdmissionLimiter::builder(config("i1"))
        .coordinator(coordinator.clone())
        .build()
        .unwrap();
    first.start().await.unwrap();

    // Alone in the fleet, the full budget applies.
    let tpm = first
        .get_model_stats("shared")
        .unwrap()
        .counters
        .tokens_per_minute
        .unwrap();
    assert_eq!(tpm.limit, 100_000);

    let second = AdmissionLimiter::builder(config("i2"))
        .coordinator(coordinator.clone())
        .build()
        .unwrap();
    second.start().await.unwrap();

    // Let the first instance consume the membership push.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for limiter in [&first, &second] {
        let stats = limiter.get_model_stats("shared").unwrap();
        assert_eq!(
            stats.counters.tokens_per_minute.unwrap().limit,
            50_000,
            "each instance gets half the declared budget"
        );
        assert_eq!(stats.concurrency.unwrap().limit, 4);
    }

    let allocation = first.get_allocation().unwrap();
    assert_eq!(allocation.instance_count, 2);
    // 8 concurrency-bounded slots split two ways.
    assert_eq!(allocation.per_model["shared"].total_slots, 4);

    // An instance leaving returns its share.
    second.stop().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let tpm = first
        .get_model_stats("shared")
        .unwrap()
        .counters
        .tokens_per_minute
        .unwrap();
    assert_eq!(tpm.limit, 100_000);

    first.stop().await;
}

/// A coordinator refusing admission on every model fails the job with the
/// backend-rejection error, not local exhaustion.
#[tokio::test]
async fn backend_rejecting_every_model_fails_the_job() {
    struct RejectEverything;

    #[async_trait]
    impl Coordinator for RejectEverything {
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
            Ok(false)
        }

        async fn release(&self, _context: &ReleaseContext) -> Result<(), BoxError> {
            Ok(())
        }

        async fn heartbeat(&self, _instance_id: &str) {}

        async fn unregister(&self, _instance_id: &str) {}
    }

    let limiter = AdmissionLimiter::builder(config("lonely"))
        .coordinator(Arc::new(RejectEverything))
        .build()
        .unwrap();
    limiter.start().await.unwrap();

    let error = limiter
        .queue_job::<(), _, _>(JobOptions::default(), |_context| async move {
            panic!("the job must never run");
        })
        .await
        .unwrap_err();
    assert!(matches!(error, LimiterError::AllModelsRejectedByBackend));

    limiter.stop().await;
}

/// Per-instance usage tracked by the coordinator bounds concurrent jobs,
/// and releases hand the slots back.
#[tokio::test(start_paused = true)]
async fn coordinator_usage_bounds_in_flight_jobs() {
    let coordinator = Arc::new(admission_limiter::MemoryCoordinator::new(
        "fleet",
        Duration::from_secs(30),
    ));
    let limiter = Arc::new(
        AdmissionLimiter::builder(config("solo"))
            .coordinator(coordinator.clone())
            .build()
            .unwrap(),
    );
    limiter.start().await.unwrap();

    // The solo instance owns all 8 slots; run a batch through and verify
    // the coordinator's accounting drains back to nothing in flight.
    let mut jobs = Vec::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        jobs.push(tokio::spawn(async move {
            limiter
                .queue_job(JobOptions::default(), |_context| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(JobOutcome::resolved(
                        (),
                        JobUsage {
                            input_tokens: 1_000,
                            request_count: 1,
                            ..JobUsage::default()
                        },
                    ))
                })
                .await
                .unwrap();
        }));
    }
    for job in jobs {
        job.await.unwrap();
    }

    // All distributed slots were returned: another job is admitted.
    limiter
        .queue_job(JobOptions::default(), |_context| async move {
            Ok(JobOutcome::resolved((), JobUsage::default()))
        })
        .await
        .unwrap();

    limiter.stop().await;
}
