//! One-shot map filtering at loop closure.
//!
//! After the full bundle adjustment the working cone list still carries
//! everything the first lap ever saw: badly constrained cones, duplicates
//! that survived association, phantom detections far off the track. One
//! filter pass prunes them and back-fills unknown cone types, after which
//! the surviving cones become the frozen global map.

use crate::cone::{Cone, KIND_LEFT, KIND_RIGHT, KIND_UNKNOWN};
use crate::geometry::Pose2;
use tracing::debug;

/// A cone farther than this from every keyframe pose is off the track (m).
const MAX_POSE_DISTANCE: f64 = 4.0;

/// Cones seen fewer times than this are not trustworthy.
const MIN_OBSERVATIONS: usize = 2;

/// Runs the full filter pass over the working cone list.
///
/// Order matters: the optimization-residual check and the pairwise
/// deduplication run on all cones, then the pose-distance and
/// observation-count pruning, then type back-fill on what is left.
pub fn filter_map(cones: &mut [Cone], poses: &[Pose2], same_cone_threshold: f64) {
    for cone in cones.iter_mut() {
        cone.calculate_mean();
    }

    // The distance between a cone's optimized position and its own
    // observation mean is its residual after optimization; a residual above
    // the association threshold means the samples never belonged together.
    for cone in cones.iter_mut() {
        if let Some(optimized) = cone.optimized_position() {
            if (optimized - cone.mean_position()).norm() > same_cone_threshold {
                cone.set_valid(false);
            }
        }
    }

    // Deduplicate on optimized positions; the earlier id wins.
    for i in 0..cones.len() {
        for j in 0..cones.len() {
            if i == j || !cones[i].is_valid() || !cones[j].is_valid() {
                continue;
            }
            let separation = (cones[i].best_position() - cones[j].best_position()).norm();
            if separation < same_cone_threshold {
                cones[j].set_valid(false);
            }
        }
    }

    // Prune cones the vehicle never came near and one-off sightings; give
    // the survivors with an unknown type a colour from the bearing sign at
    // the nearest pose (left of the travel direction is the first colour).
    for cone in cones.iter_mut() {
        let nearest = poses
            .iter()
            .map(|pose| (cone.distance_from(pose), pose))
            .min_by(|a, b| a.0.total_cmp(&b.0));
        let Some((distance, nearest_pose)) = nearest else {
            cone.set_valid(false);
            continue;
        };
        if distance > MAX_POSE_DISTANCE || cone.observation_count() < MIN_OBSERVATIONS {
            cone.set_valid(false);
        } else if cone.kind() == KIND_UNKNOWN {
            if cone.bearing_from_deg(nearest_pose) > 0.0 {
                cone.set_kind(KIND_LEFT);
            } else {
                cone.set_kind(KIND_RIGHT);
            }
        }
    }

    let surviving = cones.iter().filter(|c| c.is_valid()).count();
    debug!(total = cones.len(), surviving, "map filter finished");
}
