//! Time source abstraction.
//!
//! Drivers, the failed-job provider and the scheduler read the current time
//! through [`Clock`] so tests can control visibility delays and cron checks.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock() = time;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Returns the default wall clock handle.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + ChronoDuration::seconds(90));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();
        clock.set(start + ChronoDuration::hours(1));
        assert_eq!(other.now(), start + ChronoDuration::hours(1));
    }
}
