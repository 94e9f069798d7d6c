//! lapmap Environment Abstraction Layer
//!
//! The SLAM engine runs on plain OS threads and touches the outside world in
//! exactly two places: it reads a clock, and it hands finished messages to a
//! sink. This crate owns those two seams so the engine can run in
//! **Production** (wall clock, real bus) and in **Simulation/tests** (manual
//! clock, buffering sink) without changing a line.
//!
//! # Example
//!
//! ```
//! use lapmap_env::{Clock, ManualClock, Timestamp};
//! use std::time::Duration;
//!
//! let clock = ManualClock::starting_at(Timestamp::from_micros(0));
//! clock.advance(Duration::from_millis(100));
//! assert_eq!(clock.now().as_micros(), 100_000);
//! ```

mod context;
mod error;
mod sink;
mod time;

pub use context::{Clock, ManualClock, SystemClock};
pub use error::EnvError;
pub use sink::{BufferSink, Delivery, MessageSink};
pub use time::Timestamp;
