//! Clock abstraction so throttling and backoff logic can run under
//! virtual time in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock implementation used in production.
#[derive(Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
pub struct TestClock {
    current: parking_lot::Mutex<Instant>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            current: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn real_clock() -> SharedClock {
    Arc::new(RealClock)
}
