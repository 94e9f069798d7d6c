//! Frame transforms between the sensor, the vehicle and the track.
//!
//! The perception front-end reports cones in the lidar frame as spherical
//! coordinates (azimuth/zenith in degrees, range in metres). Everything the
//! rest of the pipeline does happens in the vehicle centre-of-gravity frame
//! or in the local Cartesian track frame, so this module owns the three hops:
//! lidar → CoG, spherical → Cartesian, local → global.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Mean Earth radius in metres, for the tangent-plane projection.
const EARTH_RADIUS: f64 = 6_371_000.0;

/// An SE(2) pose in the local track frame: position plus heading.
///
/// Heading is in radians, kept in (−π, π].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    /// Position component.
    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    /// The relative pose taking `self` to `other`: `self⁻¹ ∘ other`.
    ///
    /// This is the measurement carried by an odometry edge.
    pub fn relative_to(&self, other: &Pose2) -> Pose2 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2 {
            x: cos_t * dx + sin_t * dy,
            y: -sin_t * dx + cos_t * dy,
            theta: wrap_angle(other.theta - self.theta),
        }
    }

    /// Expresses a global point in this pose's frame.
    pub fn to_local(&self, global: &Vector2<f64>) -> Vector2<f64> {
        let d = global - self.translation();
        let (sin_t, cos_t) = self.theta.sin_cos();
        Vector2::new(cos_t * d.x + sin_t * d.y, -sin_t * d.x + cos_t * d.y)
    }

    /// Expresses a point in this pose's frame globally.
    pub fn to_global(&self, local: &Vector2<f64>) -> Vector2<f64> {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Vector2::new(
            cos_t * local.x - sin_t * local.y + self.x,
            sin_t * local.x + cos_t * local.y + self.y,
        )
    }

    /// Euclidean distance between the positions of two poses.
    pub fn distance_to(&self, other: &Pose2) -> f64 {
        (self.translation() - other.translation()).norm()
    }
}

/// Wraps an angle in radians into (−π, π].
pub fn wrap_angle(mut theta: f64) -> f64 {
    while theta > PI {
        theta -= 2.0 * PI;
    }
    while theta <= -PI {
        theta += 2.0 * PI;
    }
    theta
}

/// Moves a lidar-frame polar reading to the vehicle centre of gravity.
///
/// The lidar sits `lidar_dist_to_cog` metres ahead of the CoG along the
/// vehicle's longitudinal axis. With the cone at range `d` and azimuth `az`
/// from the lidar, the CoG range follows from the law of cosines over the
/// CoG-lidar-cone triangle and the CoG azimuth from the law of sines.
///
/// Takes and returns the azimuth in degrees. Returns `(azimuth, range)`.
pub fn transform_cone_to_cog(azimuth_deg: f64, range: f64, lidar_dist_to_cog: f64) -> (f64, f64) {
    let sign = if azimuth_deg < 0.0 { -1.0 } else { 1.0 };
    let angle = PI - azimuth_deg.to_radians().abs();
    let range_new = (lidar_dist_to_cog * lidar_dist_to_cog + range * range
        - 2.0 * lidar_dist_to_cog * range * angle.cos())
    .sqrt();
    if range_new < 1e-9 {
        // Cone collapsed onto the CoG; direction is undefined, keep the input.
        return (azimuth_deg, range_new);
    }
    let sine = ((angle.sin() * range) / range_new).clamp(-1.0, 1.0);
    let azimuth_new = sine.asin().to_degrees();
    (azimuth_new * sign, range_new)
}

/// Converts a lidar spherical reading into Cartesian CoG coordinates.
///
/// Azimuth and zenith are in degrees. The CoG correction is applied first,
/// then the usual spherical expansion. z is retained even though the map is
/// planar; the frame assembler stores the cone type there on the wire.
pub fn spherical_to_cartesian(
    azimuth_deg: f64,
    zenith_deg: f64,
    range: f64,
    lidar_dist_to_cog: f64,
) -> Vector3<f64> {
    let (azimuth_deg, range) = transform_cone_to_cog(azimuth_deg, range, lidar_dist_to_cog);
    let azimuth = azimuth_deg.to_radians();
    let zenith = zenith_deg.to_radians();
    Vector3::new(
        range * zenith.cos() * azimuth.cos(),
        range * zenith.cos() * azimuth.sin(),
        range * zenith.sin(),
    )
}

/// Projects a lidar spherical reading into the global track frame.
pub fn cone_to_global(
    pose: &Pose2,
    azimuth_deg: f64,
    zenith_deg: f64,
    range: f64,
    lidar_dist_to_cog: f64,
) -> Vector2<f64> {
    let local = spherical_to_cartesian(azimuth_deg, zenith_deg, range, lidar_dist_to_cog);
    pose.to_global(&local.xy())
}

/// Projects a WGS84 position onto the local tangent plane at `reference`.
///
/// Both arguments are `[latitude, longitude]` in degrees; the result is
/// `[east, north]` in metres. An equirectangular approximation is plenty over
/// the few hundred metres a closed circuit spans.
pub fn wgs84_to_cartesian(reference: [f64; 2], position: [f64; 2]) -> [f64; 2] {
    let lat0 = reference[0].to_radians();
    let d_lat = (position[0] - reference[0]).to_radians();
    let d_lon = (position[1] - reference[1]).to_radians();
    [d_lon * EARTH_RADIUS * lat0.cos(), d_lat * EARTH_RADIUS]
}
