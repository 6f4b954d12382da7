//! Lamport clock arbitration seeded from wall time

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::Clock;

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait TimeSource: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Time source backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven time source
#[derive(Debug, Default)]
pub struct FixedTimeSource {
    now: AtomicU64,
}

impl FixedTimeSource {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for FixedTimeSource {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Compute the clock following `current` given wall time `now`
///
/// Falls back to wall time once it has caught up with the logical
/// clock, otherwise increments by one.
pub fn next_clock(current: Clock, now: u64) -> Clock {
    if current == 0 || current < now {
        now
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_next_clock_uses_wall_time_when_ahead() {
        assert_eq!(next_clock(0, 500), 500);
        assert_eq!(next_clock(100, 500), 500);
    }

    #[test]
    fn test_next_clock_increments_when_behind() {
        assert_eq!(next_clock(100, 0), 101);
        assert_eq!(next_clock(100, 100), 101);
        assert_eq!(next_clock(100, 50), 101);
    }

    #[test]
    fn test_fixed_time_source() {
        let source = FixedTimeSource::new(10);
        assert_eq!(source.now_millis(), 10);
        source.advance(5);
        assert_eq!(source.now_millis(), 15);
        source.set(3);
        assert_eq!(source.now_millis(), 3);
    }

    proptest! {
        #[test]
        fn prop_next_clock_strictly_increases(start in 1u64..u64::MAX / 2, times in prop::collection::vec(0u64..u64::MAX / 2, 1..50)) {
            let mut clock = start;
            for now in times {
                let next = next_clock(clock, now);
                prop_assert!(next > clock);
                clock = next;
            }
        }
    }
}
