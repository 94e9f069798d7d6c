//! Clock abstraction for the lapmap engine.

use crate::time::Timestamp;
use parking_lot::Mutex;
use std::time::{Duration, SystemTime};

/// The engine's only source of time.
///
/// The keyframe gate and the readiness loop are the two consumers. Keeping
/// them behind this trait lets the simulation and the unit tests drive the
/// engine on a virtual clock.
///
/// # Implementations
///
/// - **Production**: [`SystemClock`] - wraps `SystemTime` and `thread::sleep`
/// - **Simulation/tests**: [`ManualClock`] - advanced explicitly by the driver
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Suspends the calling thread for the given duration.
    ///
    /// On a manual clock this advances the virtual time instead, so a
    /// polling loop still makes progress.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A virtual clock advanced explicitly by the test or simulation driver.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given time.
    pub fn starting_at(t: Timestamp) -> Self {
        Self { now: Mutex::new(t) }
    }

    /// Advances the clock by `d`.
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock();
        *now = now.advanced_by(d);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, t: Timestamp) {
        *self.now.lock() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        // Virtual time: sleeping is just letting the world move on.
        self.advance(duration);
    }
}
