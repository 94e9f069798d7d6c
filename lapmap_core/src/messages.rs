//! Wire-facing message types.
//!
//! Shapes mirror the external IDL the surrounding system speaks: per-object
//! perception triplets (direction, distance, type) keyed by an object id,
//! geodetic pose and inertial readings inbound, and the same geolocation /
//! triplet shapes outbound. Field units are part of the contract: perception
//! angles are degrees, headings are radians.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vehicle pose, inbound from odometry and outbound from the localizer.
///
/// Depending on configuration the longitude/latitude pair is either WGS84
/// degrees or already local Cartesian metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeolocationReading {
    pub longitude: f64,
    pub latitude: f64,
    /// Heading in radians, (−π, π].
    pub heading: f64,
}

/// Split-path WGS84 position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wgs84Reading {
    pub latitude: f64,
    pub longitude: f64,
}

/// Split-path heading fix, referenced to north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NorthHeadingReading {
    pub north_heading: f64,
}

/// Yaw rate about the vertical axis, rad/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngularVelocityReading {
    pub angular_velocity_z: f64,
}

/// Ground speed along the travel direction, m/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundSpeedReading {
    pub ground_speed: f64,
}

/// State-machine broadcast; state 2 arms the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchStateReading {
    pub state: i32,
}

/// Direction to a perceived object, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectDirection {
    pub object_id: u32,
    pub azimuth_deg: f64,
    pub zenith_deg: f64,
}

/// Range to a perceived object, metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectDistance {
    pub object_id: u32,
    pub range: f64,
}

/// Type tag of a perceived object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectKind {
    pub object_id: u32,
    pub kind: i32,
}

/// One pre-grouped cone: the three per-object messages for a single id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConePackage {
    pub direction: ObjectDirection,
    pub distance: ObjectDistance,
    pub kind: ObjectKind,
}

/// A pre-grouped perception packet: object id → cone package.
///
/// Ordered map so frame columns are deterministic in object-id order.
pub type ConeBundle = BTreeMap<u32, ConePackage>;

/// Everything the engine publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboundMessage {
    Pose(GeolocationReading),
    Direction(ObjectDirection),
    Distance(ObjectDistance),
    Kind(ObjectKind),
}
