//! The cone landmark record.
//!
//! A [`Cone`] accumulates every observation ever associated with one physical
//! cone: the measurement in the vehicle frame at the observing keyframe, its
//! projection into the track frame, and which keyframe saw it. The mean and
//! per-axis spread of the global samples seed the pose graph; the optimizer
//! writes its refined position back in place.

use crate::geometry::Pose2;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Cone type tag as delivered by perception. 0 is unassigned.
pub const KIND_UNKNOWN: i32 = 0;
/// Cone on the left side of the travel direction (first colour).
pub const KIND_LEFT: i32 = 1;
/// Cone on the right side of the travel direction (second colour).
pub const KIND_RIGHT: i32 = 2;

/// Variance floor applied before inverting into an information matrix.
///
/// A cone seen once has zero sample spread; without the floor it would claim
/// infinite information and wreck the normal equations.
const MIN_VARIANCE: f64 = 1e-3;

/// One recorded sighting of a cone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConeObservation {
    /// Measurement in the vehicle (CoG) frame at the observing keyframe.
    pub local: Vector2<f64>,
    /// The same measurement projected into the track frame.
    pub global: Vector2<f64>,
    /// Index of the observing keyframe pose.
    pub pose_index: usize,
    /// Current-cone index at the time of the sighting.
    pub cone_index: usize,
}

/// A cone landmark in the working list or the frozen map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cone {
    id: usize,
    kind: i32,
    observations: Vec<ConeObservation>,
    mean: Vector2<f64>,
    variance: Vector2<f64>,
    optimized: Option<Vector2<f64>>,
    valid: bool,
}

impl Cone {
    /// Creates a cone at an initial global position.
    ///
    /// The position is provisional until the first [`Cone::calculate_mean`];
    /// the id must equal the cone's index in the working list.
    pub fn new(x: f64, y: f64, kind: i32, id: usize) -> Self {
        Self {
            id,
            kind,
            observations: Vec::new(),
            mean: Vector2::new(x, y),
            variance: Vector2::new(MIN_VARIANCE, MIN_VARIANCE),
            optimized: None,
            valid: true,
        }
    }

    /// Records a sighting.
    ///
    /// At most one observation is kept per keyframe pose; a second sighting
    /// from the same keyframe (two frame columns matching the same cone) is
    /// dropped.
    pub fn add_observation(
        &mut self,
        local: Vector2<f64>,
        global: Vector2<f64>,
        pose_index: usize,
        cone_index: usize,
    ) {
        if self.observations.iter().any(|o| o.pose_index == pose_index) {
            return;
        }
        self.observations.push(ConeObservation {
            local,
            global,
            pose_index,
            cone_index,
        });
    }

    /// Recomputes the mean and per-axis variance of the global samples.
    pub fn calculate_mean(&mut self) {
        if self.observations.is_empty() {
            return;
        }
        let n = self.observations.len() as f64;
        let sum = self
            .observations
            .iter()
            .fold(Vector2::zeros(), |acc, o| acc + o.global);
        self.mean = sum / n;
        let sq = self.observations.iter().fold(Vector2::zeros(), |acc, o| {
            let d = o.global - self.mean;
            acc + d.component_mul(&d)
        });
        self.variance = sq / n;
    }

    // ===== Accessors =====

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn set_kind(&mut self, kind: i32) {
        self.kind = kind;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn observations(&self) -> &[ConeObservation] {
        &self.observations
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Mean of the global samples, as of the last [`Cone::calculate_mean`].
    pub fn mean_position(&self) -> Vector2<f64> {
        self.mean
    }

    /// Per-axis variance of the global samples, floored so it is always
    /// invertible into an information weight.
    pub fn covariance(&self) -> Vector2<f64> {
        Vector2::new(
            self.variance.x.max(MIN_VARIANCE),
            self.variance.y.max(MIN_VARIANCE),
        )
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized.is_some()
    }

    pub fn optimized_position(&self) -> Option<Vector2<f64>> {
        self.optimized
    }

    pub fn set_optimized(&mut self, position: Vector2<f64>) {
        self.optimized = Some(position);
    }

    /// The optimizer's estimate when present, the observation mean otherwise.
    pub fn best_position(&self) -> Vector2<f64> {
        self.optimized.unwrap_or(self.mean)
    }

    // ===== Queries from a pose =====

    /// Euclidean distance from a pose to this cone.
    pub fn distance_from(&self, pose: &Pose2) -> f64 {
        (self.best_position() - pose.translation()).norm()
    }

    /// Bearing of this cone in the pose's vehicle frame, in degrees.
    ///
    /// Positive is to the left of the heading. Degrees because that is the
    /// unit the perception wire format and its consumers use.
    pub fn bearing_from_deg(&self, pose: &Pose2) -> f64 {
        let local = pose.to_local(&self.best_position());
        local.y.atan2(local.x).to_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mean_and_variance_over_samples() {
        let mut cone = Cone::new(10.0, 0.0, KIND_LEFT, 0);
        cone.add_observation(Vector2::zeros(), Vector2::new(9.0, 1.0), 0, 0);
        cone.add_observation(Vector2::zeros(), Vector2::new(11.0, 3.0), 1, 0);
        cone.calculate_mean();

        let mean = cone.mean_position();
        assert_relative_eq!(mean.x, 10.0);
        assert_relative_eq!(mean.y, 2.0);
        let cov = cone.covariance();
        assert_relative_eq!(cov.x, 1.0);
        assert_relative_eq!(cov.y, 1.0);
    }

    #[test]
    fn single_sample_variance_is_floored() {
        let mut cone = Cone::new(5.0, 5.0, KIND_RIGHT, 3);
        cone.add_observation(Vector2::zeros(), Vector2::new(5.0, 5.0), 0, 0);
        cone.calculate_mean();
        let cov = cone.covariance();
        assert!(cov.x > 0.0 && cov.y > 0.0);
    }

    #[test]
    fn one_observation_per_keyframe() {
        let mut cone = Cone::new(0.0, 0.0, KIND_LEFT, 0);
        cone.add_observation(Vector2::zeros(), Vector2::new(1.0, 0.0), 4, 0);
        cone.add_observation(Vector2::zeros(), Vector2::new(2.0, 0.0), 4, 0);
        assert_eq!(cone.observation_count(), 1);
        cone.add_observation(Vector2::zeros(), Vector2::new(2.0, 0.0), 5, 0);
        assert_eq!(cone.observation_count(), 2);
    }

    #[test]
    fn bearing_sign_follows_side() {
        let pose = Pose2::new(0.0, 0.0, 0.0);
        let mut left = Cone::new(2.0, 1.0, KIND_UNKNOWN, 0);
        left.add_observation(Vector2::zeros(), Vector2::new(2.0, 1.0), 0, 0);
        left.calculate_mean();
        let mut right = Cone::new(2.0, -1.0, KIND_UNKNOWN, 1);
        right.add_observation(Vector2::zeros(), Vector2::new(2.0, -1.0), 0, 0);
        right.calculate_mean();

        assert!(left.bearing_from_deg(&pose) > 0.0);
        assert!(right.bearing_from_deg(&pose) < 0.0);
        assert_relative_eq!(left.distance_from(&pose), 5.0_f64.sqrt());
    }

    #[test]
    fn optimized_position_takes_over() {
        let mut cone = Cone::new(1.0, 1.0, KIND_LEFT, 0);
        cone.add_observation(Vector2::zeros(), Vector2::new(1.0, 1.0), 0, 0);
        cone.calculate_mean();
        assert!(!cone.is_optimized());
        assert_relative_eq!(cone.best_position().x, 1.0);

        cone.set_optimized(Vector2::new(1.5, 0.5));
        assert!(cone.is_optimized());
        assert_relative_eq!(cone.best_position().x, 1.5);
        assert_relative_eq!(cone.best_position().y, 0.5);
    }
}
