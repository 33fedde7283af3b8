use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    config::ModelConfig,
    counter::{epoch_millis, CounterStats, TimeWindowCounter},
};

pub(crate) const MINUTE: Duration = Duration::from_secs(60);
pub(crate) const DAY: Duration = Duration::from_secs(86_400);

/// The reservation shape of one event: how much it charges each counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventShape {
    pub requests: u64,
    pub tokens: u64,
}

/// What an attempt actually consumed, in counter units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ActualUsage {
    pub requests: u64,
    pub tokens: u64,
}

/// Window boundaries captured when a reservation was made.
///
/// A refund is only valid against the same boundaries: once a counter's
/// window has rolled, its part of the refund is skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reservation {
    /// Requests-per-minute window observed at reserve time.
    pub rpm_window_start: Option<u64>,
    /// Requests-per-day window observed at reserve time.
    pub rpd_window_start: Option<u64>,
    /// Tokens-per-minute window observed at reserve time.
    pub tpm_window_start: Option<u64>,
    /// Tokens-per-day window observed at reserve time.
    pub tpd_window_start: Option<u64>,
}

/// Snapshot of all present counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersStats {
    /// Requests per minute, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<CounterStats>,
    /// Requests per day, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<CounterStats>,
    /// Tokens per minute, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<CounterStats>,
    /// Tokens per day, when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_day: Option<CounterStats>,
}

/// New limits pushed onto a model, typically this instance's share of the
/// fleet-wide capacity. Absent fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitOverride {
    /// New requests-per-minute limit.
    pub requests_per_minute: Option<u64>,
    /// New requests-per-day limit.
    pub requests_per_day: Option<u64>,
    /// New tokens-per-minute limit.
    pub tokens_per_minute: Option<u64>,
    /// New tokens-per-day limit.
    pub tokens_per_day: Option<u64>,
    /// New in-flight ceiling.
    pub max_concurrent_requests: Option<u64>,
}

impl RateLimitOverride {
    pub(crate) fn is_empty(&self) -> bool {
        self.requests_per_minute.is_none()
            && self.requests_per_day.is_none()
            && self.tokens_per_minute.is_none()
            && self.tokens_per_day.is_none()
            && self.max_concurrent_requests.is_none()
    }
}

#[derive(Debug, Default)]
struct Counters {
    rpm: Option<TimeWindowCounter>,
    rpd: Option<TimeWindowCounter>,
    tpm: Option<TimeWindowCounter>,
    tpd: Option<TimeWindowCounter>,
}

/// Atomic reserve / refund over a model's counter set.
///
/// All four counters live behind one lock so that a reservation is
/// all-or-nothing with respect to concurrent admissions on the same model:
/// either every counter is checked and charged, or none is touched.
#[derive(Debug)]
pub(crate) struct CapacityBookkeeper {
    counters: Mutex<Counters>,
}

impl CapacityBookkeeper {
    pub(crate) fn new(model_id: &str, config: &ModelConfig) -> Self {
        let now = epoch_millis();
        let counter = |limit: Option<u64>, window: Duration, kind: &str| {
            limit.map(|limit| {
                TimeWindowCounter::new(limit, window, format!("{model_id}/{kind}"), now)
            })
        };
        Self {
            counters: Mutex::new(Counters {
                rpm: counter(config.rpm, MINUTE, "rpm"),
                rpd: counter(config.rpd, DAY, "rpd"),
                tpm: counter(config.tpm, MINUTE, "tpm"),
                tpd: counter(config.tpd, DAY, "tpd"),
            }),
        }
    }

    /// Whether every present counter could absorb one event of this shape.
    pub(crate) fn has_capacity_for(&self, shape: &EventShape) -> bool {
        let now = epoch_millis();
        let mut counters = self.counters.lock();
        Self::check(&mut counters, shape, now)
    }

    /// Charge every counter for one event, all-or-nothing. Returns the
    /// window boundaries the refund must later be keyed on, or `None`
    /// without mutating anything when any counter lacks capacity.
    pub(crate) fn try_reserve(&self, shape: &EventShape) -> Option<Reservation> {
        let now = epoch_millis();
        let mut counters = self.counters.lock();
        if !Self::check(&mut counters, shape, now) {
            return None;
        }
        let mut reservation = Reservation::default();
        if let Some(rpm) = counters.rpm.as_mut() {
            reservation.rpm_window_start = Some(rpm.window_start(now));
            rpm.add(shape.requests, now);
        }
        if let Some(rpd) = counters.rpd.as_mut() {
            reservation.rpd_window_start = Some(rpd.window_start(now));
            rpd.add(shape.requests, now);
        }
        if let Some(tpm) = counters.tpm.as_mut() {
            reservation.tpm_window_start = Some(tpm.window_start(now));
            tpm.add(shape.tokens, now);
        }
        if let Some(tpd) = counters.tpd.as_mut() {
            reservation.tpd_window_start = Some(tpd.window_start(now));
            tpd.add(shape.tokens, now);
        }
        Some(reservation)
    }

    /// Refund the difference between the reserved estimate and the actual
    /// usage. Counters whose window rolled since the reservation keep their
    /// (fresh) usage untouched; over-consumption (`actual > estimated`) is
    /// not charged again.
    pub(crate) fn release(
        &self,
        shape: &EventShape,
        actual: &ActualUsage,
        reservation: &Reservation,
    ) {
        let request_refund = shape.requests.saturating_sub(actual.requests);
        let token_refund = shape.tokens.saturating_sub(actual.tokens);
        if request_refund == 0 && token_refund == 0 {
            return;
        }

        let now = epoch_millis();
        let mut counters = self.counters.lock();
        if request_refund > 0 {
            if let (Some(rpm), Some(window)) =
                (counters.rpm.as_mut(), reservation.rpm_window_start)
            {
                rpm.subtract_if_same_window(request_refund, window, now);
            }
            if let (Some(rpd), Some(window)) =
                (counters.rpd.as_mut(), reservation.rpd_window_start)
            {
                rpd.subtract_if_same_window(request_refund, window, now);
            }
        }
        if token_refund > 0 {
            if let (Some(tpm), Some(window)) =
                (counters.tpm.as_mut(), reservation.tpm_window_start)
            {
                tpm.subtract_if_same_window(token_refund, window, now);
            }
            if let (Some(tpd), Some(window)) =
                (counters.tpd.as_mut(), reservation.tpd_window_start)
            {
                tpd.subtract_if_same_window(token_refund, window, now);
            }
        }
    }

    /// Apply new limits. Absent fields are left untouched; usage is never
    /// drained, so repeated identical overrides are idempotent.
    pub(crate) fn set_limits(&self, limits: &RateLimitOverride) {
        let mut counters = self.counters.lock();
        if let (Some(rpm), Some(limit)) = (counters.rpm.as_mut(), limits.requests_per_minute) {
            rpm.set_limit(limit);
        }
        if let (Some(rpd), Some(limit)) = (counters.rpd.as_mut(), limits.requests_per_day) {
            rpd.set_limit(limit);
        }
        if let (Some(tpm), Some(limit)) = (counters.tpm.as_mut(), limits.tokens_per_minute) {
            tpm.set_limit(limit);
        }
        if let (Some(tpd), Some(limit)) = (counters.tpd.as_mut(), limits.tokens_per_day) {
            tpd.set_limit(limit);
        }
    }

    pub(crate) fn stats(&self) -> CountersStats {
        let now = epoch_millis();
        let mut counters = self.counters.lock();
        CountersStats {
            requests_per_minute: counters.rpm.as_mut().map(|c| c.stats(now)),
            requests_per_day: counters.rpd.as_mut().map(|c| c.stats(now)),
            tokens_per_minute: counters.tpm.as_mut().map(|c| c.stats(now)),
            tokens_per_day: counters.tpd.as_mut().map(|c| c.stats(now)),
        }
    }

    /// Events of this shape the counters could admit with all windows
    /// empty. Used to size the local slot pool.
    pub(crate) fn slot_ceiling(&self, shape: &EventShape) -> Option<u64> {
        let counters = self.counters.lock();
        let mut ceiling: Option<u64> = None;
        let mut apply = |limit: u64, per_event: u64| {
            if per_event == 0 {
                return;
            }
            let slots = limit / per_event;
            ceiling = Some(ceiling.map_or(slots, |c| c.min(slots)));
        };
        if let Some(rpm) = counters.rpm.as_ref() {
            apply(rpm.limit(), shape.requests);
        }
        if let Some(rpd) = counters.rpd.as_ref() {
            apply(rpd.limit(), shape.requests);
        }
        if let Some(tpm) = counters.tpm.as_ref() {
            apply(tpm.limit(), shape.tokens);
        }
        if let Some(tpd) = counters.tpd.as_ref() {
            apply(tpd.limit(), shape.tokens);
        }
        ceiling
    }

    fn check(counters: &mut Counters, shape: &EventShape, now: u64) -> bool {
        let mut fits = |counter: &mut Option<TimeWindowCounter>, n: u64| match counter.as_mut() {
            Some(counter) => counter.has_capacity_for(n, now),
            None => true,
        };
        fits(&mut counters.rpm, shape.requests)
            && fits(&mut counters.rpd, shape.requests)
            && fits(&mut counters.tpm, shape.tokens)
            && fits(&mut counters.tpd, shape.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(rpm: Option<u64>, tpm: Option<u64>) -> ModelConfig {
        ModelConfig {
            rpm,
            tpm,
            ..ModelConfig::default()
        }
    }

    const SHAPE: EventShape = EventShape {
        requests: 1,
        tokens: 1_000,
    };

    #[test]
    fn reserve_charges_every_counter() {
        let bookkeeper = CapacityBookkeeper::new("m", &model(Some(10), Some(5_000)));

        let reservation = bookkeeper.try_reserve(&SHAPE).expect("capacity available");
        assert!(reservation.rpm_window_start.is_some());
        assert!(reservation.tpm_window_start.is_some());
        assert!(reservation.rpd_window_start.is_none(), "no rpd configured");

        let stats = bookkeeper.stats();
        assert_eq!(stats.requests_per_minute.unwrap().current, 1);
        assert_eq!(stats.tokens_per_minute.unwrap().current, 1_000);
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        // Requests fit but tokens do not: nothing may be charged.
        let bookkeeper = CapacityBookkeeper::new("m", &model(Some(10), Some(500)));

        assert!(bookkeeper.try_reserve(&SHAPE).is_none());
        let stats = bookkeeper.stats();
        assert_eq!(stats.requests_per_minute.unwrap().current, 0);
        assert_eq!(stats.tokens_per_minute.unwrap().current, 0);
    }

    #[test]
    fn release_refunds_unused_estimate() {
        let bookkeeper = CapacityBookkeeper::new("m", &model(None, Some(100_000)));
        let shape = EventShape {
            requests: 1,
            tokens: 10_000,
        };

        let reservation = bookkeeper.try_reserve(&shape).unwrap();
        bookkeeper.release(
            &shape,
            &ActualUsage {
                requests: 1,
                tokens: 6_000,
            },
            &reservation,
        );

        assert_eq!(bookkeeper.stats().tokens_per_minute.unwrap().current, 6_000);
    }

    #[test]
    fn release_ignores_overconsumption() {
        let bookkeeper = CapacityBookkeeper::new("m", &model(None, Some(100_000)));
        let shape = EventShape {
            requests: 1,
            tokens: 10_000,
        };

        let reservation = bookkeeper.try_reserve(&shape).unwrap();
        bookkeeper.release(
            &shape,
            &ActualUsage {
                requests: 1,
                tokens: 15_000,
            },
            &reservation,
        );

        assert_eq!(
            bookkeeper.stats().tokens_per_minute.unwrap().current,
            10_000,
            "actual above estimate must not charge again"
        );
    }

    #[test]
    fn stale_reservation_does_not_refund_new_window() {
        let bookkeeper = CapacityBookkeeper::new("m", &model(None, Some(100_000)));
        let shape = EventShape {
            requests: 1,
            tokens: 10_000,
        };

        let reservation = bookkeeper.try_reserve(&shape).unwrap();
        // Fake a reservation taken in the previous minute window.
        let stale = Reservation {
            tpm_window_start: reservation.tpm_window_start.map(|w| w - 60_000),
            ..reservation
        };
        bookkeeper.release(&shape, &ActualUsage::default(), &stale);

        assert_eq!(
            bookkeeper.stats().tokens_per_minute.unwrap().current,
            10_000,
            "refund keyed on an old window must be skipped"
        );
    }

    #[test]
    fn set_limits_is_idempotent_on_usage() {
        let bookkeeper = CapacityBookkeeper::new("m", &model(Some(10), None));
        bookkeeper.try_reserve(&SHAPE).unwrap();

        let limits = RateLimitOverride {
            requests_per_minute: Some(5),
            ..RateLimitOverride::default()
        };
        bookkeeper.set_limits(&limits);
        bookkeeper.set_limits(&limits);

        let stats = bookkeeper.stats().requests_per_minute.unwrap();
        assert_eq!(stats.current, 1);
        assert_eq!(stats.limit, 5);
    }

    #[test]
    fn slot_ceiling_is_min_across_dimensions() {
        let bookkeeper = CapacityBookkeeper::new("m", &model(Some(10), Some(5_000)));
        // 10 requests, or 5 events of 1000 tokens: tokens bind first.
        assert_eq!(bookkeeper.slot_ceiling(&SHAPE), Some(5));
    }
}
