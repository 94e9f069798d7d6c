//! Deterministic closed-circuit simulation harness for the lapmap engine.
//!
//! Everything is derived from a single 64-bit seed: the sensor noise, the
//! synthetic streams, and therefore the whole run. Any failing seed
//! reproduces exactly.

pub mod runner;
pub mod track;

pub use runner::{RaceResult, RaceRunner, SimEngine};
pub use track::{TrackConfig, TrackOracle, TrueCone};
