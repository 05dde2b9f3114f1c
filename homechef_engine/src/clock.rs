//! Wall-clock abstraction.
//!
//! Every time-dependent rule in the engine (countdown expiry, chef response window, webhook backoff) reads the time
//! through a [`Clock`] so that tests can drive time explicitly with [`ManualClock`].
use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, DurationRound, Utc};

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Truncates to whole milliseconds. Timestamps are stored as text and compared lexically, so every stored value has
/// the same precision.
pub fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::milliseconds(1)).unwrap_or(t)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_millis(Utc::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(truncate_to_millis(start))) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_millis(*self.now.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Timelike};

    use super::*;

    #[test]
    fn manual_clock_moves_on_request() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(45));
        assert_eq!(clock.now(), start + Duration::seconds(45));
        let c2 = clock.clone();
        c2.advance(Duration::seconds(15));
        assert_eq!(clock.now().minute(), 1);
    }

    #[test]
    fn system_clock_has_millisecond_precision() {
        let now = SystemClock.now();
        assert_eq!(now.nanosecond() % 1_000_000, 0);
    }
}
