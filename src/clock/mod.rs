use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Source of "now" for the run coordinator and scheduler.
pub trait Clock: Send + Sync {
    /// Returns the current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let Ok(delta) = TimeDelta::from_std(by) else {
            return;
        };
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Returns how long to wait from `now` until the next `period` boundary plus
/// `delay`, counted from the Unix epoch.
///
/// With a 5m period and 10s delay, runs land at :00:10, :05:10, :10:10, ...
pub fn until_next_tick(now: DateTime<Utc>, period: Duration, delay: Duration) -> Duration {
    let period_ms = period.as_millis().max(1);
    let delay_ms = delay.as_millis() % period_ms;

    let now_ms = u128::try_from(now.timestamp_millis()).unwrap_or(0);
    let phase = (now_ms + period_ms - delay_ms) % period_ms;
    let wait_ms = period_ms - phase;

    Duration::from_millis(u64::try_from(wait_ms).unwrap_or(u64::MAX))
}
