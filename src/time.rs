//! For mocking purposes, access to the current time is routed through this trait.
//!
//! Tasks and jobs are always timestamped in UTC at rest; a [`Clock`] hands
//! out that UTC instant. Trigger arithmetic itself happens in the task's
//! configured IANA zone and is done in `trigger.rs`.

use jiff::{Span, Timestamp};

/// UTC instant. Tasks, jobs, and trigger results are all stamped with this.
pub type Instant = Timestamp;

pub trait Clock: std::fmt::Debug + Send + Sync {
    /// Return the current UTC instant.
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Timestamp::now()
    }
}

/// Mock clock for deterministic trigger/scheduler tests.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    stamp: std::cell::Cell<Instant>,
}

// SAFETY-free: tests are single-threaded around this clock, Cell is enough.
unsafe impl Sync for MockClock {}

impl MockClock {
    pub fn new(stamp: Instant) -> Self {
        Self {
            stamp: std::cell::Cell::new(stamp),
        }
    }

    pub fn advance(&self, span: Span) {
        let next = self.stamp.get().checked_add(span).expect("mock clock overflow");
        self.stamp.set(next);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.stamp.get()
    }
}

#[cfg(test)]
pub mod mock {
    use super::{Instant, MockClock};
    use jiff::civil::date;

    /// Default starting instant for tests: 2021-01-01T12:00:00Z.
    pub fn start() -> Instant {
        date(2021, 1, 1)
            .at(12, 0, 0, 0)
            .in_tz("UTC")
            .unwrap()
            .timestamp()
    }

    pub fn clock() -> MockClock {
        MockClock::new(start())
    }
}
