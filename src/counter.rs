use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Milliseconds since the unix epoch.
///
/// Window alignment is done on wall-clock time so that e.g. per-minute
/// windows start at the top of each minute on every instance.
pub(crate) fn epoch_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch");
    u64::try_from(since_epoch.as_millis()).expect("epoch millis should fit in u64")
}

/// An integer usage counter which resets at fixed wall-clock windows.
///
/// Windows are aligned to epoch multiples of the window length, so a 60s
/// counter rolls over at the start of every wall-clock minute. The reset is
/// lazy: it happens on whichever observation first sees the new window.
///
/// The counter itself is plain data. Owners are expected to guard it (and
/// any siblings which must be checked atomically) with a single lock, so
/// every method takes `&mut self` and an explicit `now` in epoch millis.
/// Passing the same `now` to a group of counters gives one consistent
/// timestamp across the whole critical section.
#[derive(Debug)]
pub(crate) struct TimeWindowCounter {
    name: String,
    window_ms: u64,
    limit: u64,
    current: u64,
    window_start: u64,
}

/// Point-in-time snapshot of a single counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterStats {
    /// Usage recorded in the current window.
    pub current: u64,
    /// The window limit.
    pub limit: u64,
    /// Capacity left in the current window.
    pub remaining: u64,
}

impl TimeWindowCounter {
    pub(crate) fn new(limit: u64, window: Duration, name: impl Into<String>, now: u64) -> Self {
        let window_ms = u64::try_from(window.as_millis()).expect("window length fits in u64");
        assert!(window_ms > 0, "window must be non-zero");
        Self {
            name: name.into(),
            window_ms,
            limit,
            current: 0,
            window_start: now - now % window_ms,
        }
    }

    /// Reset the counter if `now` has moved past the current window.
    fn roll(&mut self, now: u64) {
        let aligned = now - now % self.window_ms;
        if aligned > self.window_start {
            tracing::trace!(
                counter = %self.name,
                window_start = aligned,
                dropped = self.current,
                "window rolled"
            );
            self.window_start = aligned;
            self.current = 0;
        }
    }

    pub(crate) fn has_capacity_for(&mut self, n: u64, now: u64) -> bool {
        self.roll(now);
        self.current.saturating_add(n) <= self.limit
    }

    pub(crate) fn add(&mut self, n: u64, now: u64) {
        self.roll(now);
        self.current = self.current.saturating_add(n);
    }

    /// Subtract `n`, but only if the counter is still in the window observed
    /// at reserve time. After a rollover the new window's usage has no
    /// relation to the old reservation, so the refund is skipped.
    pub(crate) fn subtract_if_same_window(&mut self, n: u64, window_start: u64, now: u64) {
        self.roll(now);
        if self.window_start == window_start {
            self.current = self.current.saturating_sub(n);
        } else {
            tracing::trace!(
                counter = %self.name,
                refund = n,
                "refund skipped, window rolled since reserve"
            );
        }
    }

    pub(crate) fn window_start(&mut self, now: u64) -> u64 {
        self.roll(now);
        self.window_start
    }

    pub(crate) fn time_until_reset(&mut self, now: u64) -> Duration {
        self.roll(now);
        Duration::from_millis(self.window_start + self.window_ms - now)
    }

    /// Change the limit. Existing usage is kept: if `current > limit` the
    /// counter reports no remaining capacity until the window rolls or
    /// callers subtract.
    pub(crate) fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }

    pub(crate) fn stats(&mut self, now: u64) -> CounterStats {
        self.roll(now);
        CounterStats {
            current: self.current,
            limit: self.limit,
            remaining: self.limit.saturating_sub(self.current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn aligns_window_to_epoch_multiples() {
        let mut counter = TimeWindowCounter::new(10, MINUTE, "rpm", 130_000);
        assert_eq!(counter.window_start(130_000), 120_000);
        assert_eq!(counter.time_until_reset(130_000), Duration::from_millis(50_000));
    }

    #[test]
    fn counts_within_a_window() {
        let mut counter = TimeWindowCounter::new(10, MINUTE, "rpm", 0);
        assert!(counter.has_capacity_for(10, 1_000));
        assert!(!counter.has_capacity_for(11, 1_000));

        counter.add(7, 2_000);
        assert!(counter.has_capacity_for(3, 3_000));
        assert!(!counter.has_capacity_for(4, 3_000));

        let stats = counter.stats(4_000);
        assert_eq!(stats.current, 7);
        assert_eq!(stats.remaining, 3);
    }

    #[test]
    fn resets_on_window_roll() {
        let mut counter = TimeWindowCounter::new(10, MINUTE, "rpm", 0);
        counter.add(10, 1_000);
        assert!(!counter.has_capacity_for(1, 59_999));
        assert!(counter.has_capacity_for(10, 60_000));
        assert_eq!(counter.stats(60_000).current, 0);
    }

    #[test]
    fn refund_applies_in_same_window() {
        let mut counter = TimeWindowCounter::new(100, MINUTE, "tpm", 0);
        counter.add(50, 1_000);
        let reserved_at = counter.window_start(1_000);

        counter.subtract_if_same_window(20, reserved_at, 30_000);
        assert_eq!(counter.stats(30_000).current, 30);
    }

    #[test]
    fn refund_skipped_after_window_roll() {
        let mut counter = TimeWindowCounter::new(100, MINUTE, "tpm", 0);
        counter.add(50, 1_000);
        let reserved_at = counter.window_start(1_000);

        // The window rolls while the job is still running.
        counter.subtract_if_same_window(20, reserved_at, 61_000);
        assert_eq!(counter.stats(61_000).current, 0, "new window must stay untouched");
    }

    #[test]
    fn refund_clamps_at_zero() {
        let mut counter = TimeWindowCounter::new(100, MINUTE, "tpm", 0);
        counter.add(5, 1_000);
        let reserved_at = counter.window_start(1_000);
        counter.subtract_if_same_window(20, reserved_at, 2_000);
        assert_eq!(counter.stats(2_000).current, 0);
    }

    #[test]
    fn shrinking_limit_below_usage_reports_no_capacity() {
        let mut counter = TimeWindowCounter::new(100, MINUTE, "tpm", 0);
        counter.add(80, 1_000);

        counter.set_limit(50);
        let stats = counter.stats(2_000);
        assert_eq!(stats.current, 80, "set_limit must not drain usage");
        assert_eq!(stats.remaining, 0);
        assert!(!counter.has_capacity_for(1, 2_000));

        // Capacity comes back once the window rolls.
        assert!(counter.has_capacity_for(50, 60_000));
    }
}
