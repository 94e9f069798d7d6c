//! Microsecond timestamps shared by all lapmap crates.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time, in microseconds since the Unix epoch.
///
/// Sensor messages carry their sample time in this form and the keyframe
/// gate compares these against the engine clock. Deltas are taken as
/// absolute values so a clock stepping backwards never produces a negative
/// interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Creates a timestamp from microseconds since the epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Creates a timestamp from a `SystemTime`.
    pub fn from_system_time(t: SystemTime) -> Self {
        let micros = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self { micros }
    }

    /// Microseconds since the epoch.
    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Absolute distance to another timestamp, in microseconds.
    pub fn delta_micros(&self, other: Timestamp) -> i64 {
        (self.micros - other.micros).abs()
    }

    /// Absolute distance to another timestamp, in milliseconds.
    pub fn delta_millis(&self, other: Timestamp) -> f64 {
        self.delta_micros(other) as f64 / 1000.0
    }

    /// This timestamp advanced by `d`.
    pub fn advanced_by(&self, d: Duration) -> Self {
        Self {
            micros: self.micros + d.as_micros() as i64,
        }
    }
}
