//! Observation frame assembly and keyframe gating.
//!
//! Perception delivers cones either as loose per-object messages (direction,
//! distance, type sharing an object id and a sample time) or as one
//! pre-grouped bundle. Both paths end in a [`Frame`]: the cones of one sensor
//! sweep, ordered by object id. A time gate then decides which frames become
//! keyframes the SLAM backend actually ingests.

use crate::messages::{ConeBundle, ObjectDirection, ObjectDistance, ObjectKind};
use lapmap_env::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One cone of a frame, still in sensor polar form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConeReading {
    pub azimuth_deg: f64,
    pub zenith_deg: f64,
    pub range: f64,
    pub kind: i32,
}

/// The cones of one sensor sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub stamp: Timestamp,
    pub cones: Vec<ConeReading>,
}

impl Frame {
    /// Builds a frame from a pre-grouped bundle, in object-id order.
    pub fn from_bundle(stamp: Timestamp, bundle: &ConeBundle) -> Self {
        let cones = bundle
            .values()
            .map(|package| ConeReading {
                azimuth_deg: package.direction.azimuth_deg,
                zenith_deg: package.direction.zenith_deg,
                range: package.distance.range,
                kind: package.kind.kind,
            })
            .collect();
        Self { stamp, cones }
    }

    pub fn len(&self) -> usize {
        self.cones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cones.is_empty()
    }
}

/// A loose per-object message on its way into the assembler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjectMessage {
    Direction(ObjectDirection),
    Distance(ObjectDistance),
    Kind(ObjectKind),
}

impl ObjectMessage {
    fn object_id(&self) -> u32 {
        match self {
            ObjectMessage::Direction(m) => m.object_id,
            ObjectMessage::Distance(m) => m.object_id,
            ObjectMessage::Kind(m) => m.object_id,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct PartialCone {
    direction: Option<(f64, f64)>,
    range: Option<f64>,
    kind: Option<i32>,
}

impl PartialCone {
    fn complete(&self) -> Option<ConeReading> {
        let (azimuth_deg, zenith_deg) = self.direction?;
        Some(ConeReading {
            azimuth_deg,
            zenith_deg,
            range: self.range?,
            kind: self.kind?,
        })
    }
}

/// Groups loose per-object messages into frames.
///
/// Messages sharing a sample time belong to one sweep; the first message
/// whose time differs from the open frame's by more than the gathering
/// window closes the frame and starts the next. Only objects with all three
/// fields present make it into the emitted frame; partial rows are dropped
/// silently.
#[derive(Debug)]
pub struct FrameAssembler {
    gathering_time_ms: f64,
    open_stamp: Option<Timestamp>,
    partial: BTreeMap<u32, PartialCone>,
}

impl FrameAssembler {
    pub fn new(gathering_time_ms: u32) -> Self {
        Self {
            gathering_time_ms: gathering_time_ms as f64,
            open_stamp: None,
            partial: BTreeMap::new(),
        }
    }

    /// Feeds one message; returns the closed frame when `stamp` crosses the
    /// gathering boundary.
    pub fn push(&mut self, message: ObjectMessage, stamp: Timestamp) -> Option<Frame> {
        let emitted = match self.open_stamp {
            Some(open) if stamp.delta_millis(open) > self.gathering_time_ms => {
                let frame = self.close(open);
                self.open_stamp = Some(stamp);
                frame
            }
            Some(_) => None,
            None => {
                self.open_stamp = Some(stamp);
                None
            }
        };

        let entry = self.partial.entry(message.object_id()).or_default();
        match message {
            ObjectMessage::Direction(m) => entry.direction = Some((m.azimuth_deg, m.zenith_deg)),
            ObjectMessage::Distance(m) => entry.range = Some(m.range),
            ObjectMessage::Kind(m) => entry.kind = Some(m.kind),
        }

        emitted
    }

    fn close(&mut self, stamp: Timestamp) -> Option<Frame> {
        let cones: Vec<ConeReading> = self
            .partial
            .values()
            .filter_map(PartialCone::complete)
            .collect();
        self.partial.clear();
        if cones.is_empty() {
            None
        } else {
            Some(Frame { stamp, cones })
        }
    }
}

/// Time-based keyframe decimation.
///
/// A frame is admitted when more than the configured interval has passed
/// since the last admitted frame, measured on the engine clock. The very
/// first frame is always admitted.
#[derive(Debug)]
pub struct KeyframeGate {
    interval_ms: f64,
    last_keyframe: Option<Timestamp>,
}

impl KeyframeGate {
    pub fn new(interval_ms: f64) -> Self {
        Self {
            interval_ms,
            last_keyframe: None,
        }
    }

    /// Returns whether a frame arriving at `now` is a keyframe, updating the
    /// gate when it is.
    pub fn admit(&mut self, now: Timestamp) -> bool {
        let elapsed_ms = match self.last_keyframe {
            Some(last) => now.delta_millis(last),
            None => f64::INFINITY,
        };
        if elapsed_ms > self.interval_ms {
            self.last_keyframe = Some(now);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ConePackage;

    fn direction(object_id: u32, azimuth_deg: f64) -> ObjectMessage {
        ObjectMessage::Direction(ObjectDirection {
            object_id,
            azimuth_deg,
            zenith_deg: 0.0,
        })
    }

    fn distance(object_id: u32, range: f64) -> ObjectMessage {
        ObjectMessage::Distance(ObjectDistance { object_id, range })
    }

    fn kind(object_id: u32, kind: i32) -> ObjectMessage {
        ObjectMessage::Kind(ObjectKind { object_id, kind })
    }

    #[test]
    fn frame_closes_on_time_boundary() {
        let mut assembler = FrameAssembler::new(10);
        let t0 = Timestamp::from_micros(0);

        assert!(assembler.push(direction(0, 5.0), t0).is_none());
        assert!(assembler.push(distance(0, 4.0), t0).is_none());
        assert!(assembler.push(kind(0, 1), t0).is_none());

        // 20 ms later: past the 10 ms gathering window.
        let t1 = Timestamp::from_micros(20_000);
        let frame = assembler.push(direction(0, -3.0), t1).expect("frame");
        assert_eq!(frame.stamp, t0);
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.cones[0].azimuth_deg, 5.0);
        assert_eq!(frame.cones[0].range, 4.0);
        assert_eq!(frame.cones[0].kind, 1);
    }

    #[test]
    fn incomplete_objects_are_dropped() {
        let mut assembler = FrameAssembler::new(10);
        let t0 = Timestamp::from_micros(0);

        // Object 0 complete, object 1 missing its range.
        for m in [
            direction(0, 1.0),
            distance(0, 2.0),
            kind(0, 2),
            direction(1, -1.0),
            kind(1, 1),
        ] {
            assert!(assembler.push(m, t0).is_none());
        }

        let frame = assembler
            .push(direction(7, 0.0), Timestamp::from_micros(50_000))
            .expect("frame");
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.cones[0].kind, 2);
    }

    #[test]
    fn all_incomplete_yields_no_frame() {
        let mut assembler = FrameAssembler::new(10);
        assembler.push(direction(0, 1.0), Timestamp::from_micros(0));
        assert!(assembler
            .push(direction(1, 2.0), Timestamp::from_micros(90_000))
            .is_none());
    }

    #[test]
    fn clock_regression_closes_frame_too() {
        let mut assembler = FrameAssembler::new(10);
        let t0 = Timestamp::from_micros(100_000);
        assembler.push(direction(0, 1.0), t0);
        assembler.push(distance(0, 2.0), t0);
        assembler.push(kind(0, 0), t0);

        // Timestamp stepping backwards still counts as a boundary.
        let frame = assembler.push(direction(1, 0.0), Timestamp::from_micros(50_000));
        assert!(frame.is_some());
    }

    #[test]
    fn bundle_frame_is_object_id_ordered() {
        let mut bundle = ConeBundle::new();
        for (id, azimuth) in [(2u32, 20.0), (0, 0.0), (1, 10.0)] {
            bundle.insert(
                id,
                ConePackage {
                    direction: ObjectDirection {
                        object_id: id,
                        azimuth_deg: azimuth,
                        zenith_deg: 0.0,
                    },
                    distance: ObjectDistance {
                        object_id: id,
                        range: 5.0,
                    },
                    kind: ObjectKind {
                        object_id: id,
                        kind: 1,
                    },
                },
            );
        }
        let frame = Frame::from_bundle(Timestamp::from_micros(0), &bundle);
        let azimuths: Vec<f64> = frame.cones.iter().map(|c| c.azimuth_deg).collect();
        assert_eq!(azimuths, vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn keyframe_gate_decimates() {
        let mut gate = KeyframeGate::new(100.0);
        assert!(gate.admit(Timestamp::from_micros(0)));
        assert!(!gate.admit(Timestamp::from_micros(50_000)));
        assert!(!gate.admit(Timestamp::from_micros(100_000)));
        assert!(gate.admit(Timestamp::from_micros(100_001 + 100_000)));
    }
}
