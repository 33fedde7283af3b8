use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time::{timeout, Instant};

use crate::model_limiter::ModelLimiter;

/// Extra seconds past the next minute boundary the default wait reaches,
/// so a job waiting on a per-minute window survives its rollover.
const DEFAULT_WAIT_SLACK_SECS: u64 = 5;

/// The default per-model wait bound when none is configured: long enough
/// to reach into the next minute window, where per-minute counters reset.
pub(crate) fn default_max_wait(now_epoch_secs: u64) -> Duration {
    Duration::from_secs(60 - now_epoch_secs % 60 + DEFAULT_WAIT_SLACK_SECS)
}

/// Progress the selector reports while it works through the escalation
/// order, used for active-job introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectorProgress<'a> {
    /// Waiting on a model with this much wait budget left.
    Waiting {
        /// The model being waited on.
        model_id: &'a str,
        /// Remaining wait budget.
        remaining: Duration,
    },
    /// No longer waiting on any model.
    Idle,
}

/// Chooses the first model in escalation order with capacity, waiting up to
/// a per-model bound before moving on.
///
/// Instead of a raw sleep loop, waiting is a timed select on the model's
/// capacity-freed signal, re-armed at least every `poll_interval` because
/// window rollovers free capacity without any release event.
pub(crate) struct ModelSelector<'a> {
    pub(crate) escalation_order: &'a [Arc<ModelLimiter>],
    pub(crate) poll_interval: Duration,
}

impl ModelSelector<'_> {
    /// Walk the escalation order, skipping tried models.
    ///
    /// `max_wait` of zero means fail-fast for that model. Returns `None`
    /// when every untried model was skipped or timed out.
    pub(crate) async fn select(
        &self,
        tried: &HashSet<String>,
        has_capacity: impl Fn(&ModelLimiter) -> bool,
        max_wait: impl Fn(&str) -> Duration,
        mut progress: impl FnMut(SelectorProgress<'_>),
    ) -> Option<Arc<ModelLimiter>> {
        for limiter in self
            .escalation_order
            .iter()
            .filter(|limiter| !tried.contains(limiter.id()))
        {
            if has_capacity(limiter) {
                progress(SelectorProgress::Idle);
                return Some(limiter.clone());
            }

            let wait = max_wait(limiter.id());
            if wait.is_zero() {
                tracing::trace!(model = %limiter.id(), "no capacity, fail-fast");
                continue;
            }

            tracing::trace!(model = %limiter.id(), ?wait, "no capacity, waiting");
            let deadline = Instant::now() + wait;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::trace!(model = %limiter.id(), "wait budget exhausted");
                    break;
                }
                progress(SelectorProgress::Waiting {
                    model_id: limiter.id(),
                    remaining,
                });

                let step = remaining.min(self.poll_interval);
                let _ = timeout(step, limiter.capacity_freed()).await;
                if has_capacity(limiter) {
                    progress(SelectorProgress::Idle);
                    return Some(limiter.clone());
                }
            }
        }
        progress(SelectorProgress::Idle);
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bookkeeper::EventShape,
        config::ModelConfig,
        model_limiter::ModelLimiter,
    };

    use super::*;

    const SHAPE: EventShape = EventShape {
        requests: 1,
        tokens: 0,
    };

    fn limiter(id: &str, rpm: Option<u64>) -> Arc<ModelLimiter> {
        Arc::new(ModelLimiter::new(
            id,
            ModelConfig {
                rpm,
                ..ModelConfig::default()
            },
        ))
    }

    fn exhaust(limiter: &ModelLimiter, n: u64) {
        for _ in 0..n {
            limiter.try_reserve(&SHAPE).expect("capacity to exhaust");
        }
    }

    #[tokio::test]
    async fn picks_first_model_with_capacity() {
        let order = vec![limiter("a", Some(10)), limiter("b", Some(10))];
        let selector = ModelSelector {
            escalation_order: &order,
            poll_interval: Duration::from_millis(10),
        };

        let chosen = selector
            .select(
                &HashSet::new(),
                |limiter| limiter.has_capacity(&SHAPE),
                |_| Duration::ZERO,
                |_| {},
            )
            .await
            .expect("a has capacity");
        assert_eq!(chosen.id(), "a");
    }

    #[tokio::test]
    async fn skips_tried_models() {
        let order = vec![limiter("a", Some(10)), limiter("b", Some(10))];
        let selector = ModelSelector {
            escalation_order: &order,
            poll_interval: Duration::from_millis(10),
        };

        let tried: HashSet<String> = ["a".to_owned()].into();
        let chosen = selector
            .select(
                &tried,
                |limiter| limiter.has_capacity(&SHAPE),
                |_| Duration::ZERO,
                |_| {},
            )
            .await
            .expect("b has capacity");
        assert_eq!(chosen.id(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_falls_through_without_waiting() {
        let order = vec![limiter("a", Some(1)), limiter("b", Some(10))];
        exhaust(&order[0], 1);
        let selector = ModelSelector {
            escalation_order: &order,
            poll_interval: Duration::from_millis(10),
        };

        let before = Instant::now();
        let chosen = selector
            .select(
                &HashSet::new(),
                |limiter| limiter.has_capacity(&SHAPE),
                |_| Duration::ZERO,
                |_| {},
            )
            .await
            .expect("b has capacity");
        assert_eq!(chosen.id(), "b");
        assert_eq!(
            before.elapsed(),
            Duration::ZERO,
            "fail-fast must not wait at all"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_max_wait() {
        let order = vec![limiter("a", Some(1))];
        exhaust(&order[0], 1);
        let selector = ModelSelector {
            escalation_order: &order,
            poll_interval: Duration::from_millis(100),
        };

        let before = Instant::now();
        let chosen = selector
            .select(
                &HashSet::new(),
                |limiter| limiter.has_capacity(&SHAPE),
                |_| Duration::from_millis(500),
                |_| {},
            )
            .await;
        assert!(chosen.is_none());
        assert!(before.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_when_capacity_is_released() {
        // Saturate concurrency instead of counters so release is explicit.
        let order = vec![Arc::new(ModelLimiter::new(
            "a",
            ModelConfig {
                max_concurrent_requests: Some(1),
                ..ModelConfig::default()
            },
        ))];
        assert!(order[0].try_acquire_concurrency());

        let selector_order = order.clone();
        let select = tokio::spawn(async move {
            let selector = ModelSelector {
                escalation_order: &selector_order,
                poll_interval: Duration::from_secs(3600),
            };
            let before = Instant::now();
            let chosen = selector
                .select(
                    &HashSet::new(),
                    |limiter| limiter.has_capacity(&SHAPE),
                    |_| Duration::from_secs(600),
                    |_| {},
                )
                .await;
            (chosen.map(|l| l.id().to_owned()), before.elapsed())
        });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(50)).await;
        order[0].release_concurrency();

        let (chosen, elapsed) = select.await.unwrap();
        assert_eq!(chosen.as_deref(), Some("a"));
        assert!(
            elapsed < Duration::from_secs(1),
            "the release signal should wake the selector long before the poll interval"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reports_wait_progress() {
        let order = vec![limiter("a", Some(1))];
        exhaust(&order[0], 1);
        let selector = ModelSelector {
            escalation_order: &order,
            poll_interval: Duration::from_millis(50),
        };

        let mut waited_on: Vec<String> = Vec::new();
        let _ = selector
            .select(
                &HashSet::new(),
                |limiter| limiter.has_capacity(&SHAPE),
                |_| Duration::from_millis(200),
                |progress| {
                    if let SelectorProgress::Waiting { model_id, .. } = progress {
                        waited_on.push(model_id.to_owned());
                    }
                },
            )
            .await;
        assert!(waited_on.iter().all(|id| id == "a"));
        assert!(!waited_on.is_empty());
    }

    #[test]
    fn default_wait_reaches_into_next_minute() {
        // 20s into the minute: 40s remain, plus slack.
        assert_eq!(default_max_wait(20), Duration::from_secs(45));
        // At the boundary the full minute plus slack remains.
        assert_eq!(default_max_wait(60), Duration::from_secs(65));
    }
}
