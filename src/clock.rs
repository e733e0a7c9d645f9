// Time source for the batch controller
//
// The controller only ever asks "how long since the engine started", so time is a Duration from an origin.
// Monotonic is the real thing. Manual is driven by hand so tests can step straight past the force-end ceiling
// without sleeping for it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mem::sync::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub enum Clock {
    Monotonic(Instant),
    Manual(ManualClock),
}

impl Clock {
    pub fn monotonic() -> Self {
        Clock::Monotonic(Instant::now())
    }

    #[inline]
    pub fn now(&self) -> Duration {
        match self {
            Clock::Monotonic(origin) => origin.elapsed(),
            Clock::Manual(clock) => clock.now(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::monotonic()
    }
}

impl From<ManualClock> for Clock {
    fn from(clock: ManualClock) -> Self {
        Clock::Manual(clock)
    }
}

/// A clock which only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::Release);
    }
}
