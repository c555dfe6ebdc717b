//! Manually driven clock

use parking_lot::Mutex;
use std::time::Duration;
use tessera_core::{Clock, Timestamp};

/// Fixed start time shared by all fixtures (2022-01-01T00:00:00Z)
pub const TEST_EPOCH_MS: i64 = 1_640_995_200_000;

#[derive(Debug)]
struct Reading {
    now: Timestamp,
    step: Duration,
}

/// Clock that only moves when told to, or by a fixed step after every read
#[derive(Debug)]
pub struct ManualClock {
    reading: Mutex<Reading>,
}

impl ManualClock {
    /// Clock reading `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            reading: Mutex::new(Reading {
                now: start,
                step: Duration::ZERO,
            }),
        }
    }

    /// Clock reading [`TEST_EPOCH_MS`]
    pub fn at_test_epoch() -> Self {
        Self::new(Timestamp::from_millis(TEST_EPOCH_MS).unwrap())
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut reading = self.reading.lock();
        reading.now = reading.now.checked_add(by).unwrap();
    }

    /// Jump to `at`
    pub fn set(&self, at: Timestamp) {
        self.reading.lock().now = at;
    }

    /// Move forward by `step` after every subsequent read; zero stops it
    pub fn advance_on_read(&self, step: Duration) {
        self.reading.lock().step = step;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at_test_epoch()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut reading = self.reading.lock();
        let current = reading.now;
        reading.now = current.checked_add(reading.step).unwrap();
        current
    }
}
