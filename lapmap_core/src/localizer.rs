//! Localization against the frozen map.
//!
//! Once the loop is closed the map no longer moves; each keyframe instead
//! refines the vehicle pose. Raw odometry heading drifts worst, so a coarse
//! sweep re-anchors it against the map first; the matched cones then
//! constrain a single-pose graph whose solution is the published pose.

use crate::cone::Cone;
use crate::frame::Frame;
use crate::geometry::{cone_to_global, spherical_to_cartesian, Pose2};
use crate::graph::{PoseGraph, GAUSS_NEWTON_ITERATIONS, POSE_VERTEX_OFFSET};
use nalgebra::{Matrix2, Vector2};
use std::f64::consts::PI;
use tracing::{debug, trace};

/// Half-width of the heading sweep around the odometry heading (rad).
const SWEEP_HALF_RANGE: f64 = PI / 4.0;

/// Sweep step: two degrees.
const SWEEP_STEP: f64 = 0.01745 * 2.0;

/// Map cones beyond this range take no part in the heading sweep (m).
const NEIGHBOURHOOD_RANGE: f64 = 30.0;

/// A reprojected cone this close to a map cone counts as fitting (m).
const FIT_DISTANCE: f64 = 1.5;

/// A heading candidate needs at least this many fitting cones.
const MIN_FITTED: usize = 3;

/// The best candidate is accepted only below this summed error (m).
const MAX_SUM_ERROR: f64 = 3.0;

/// Association distance against the frozen map (m).
const MATCH_DISTANCE: f64 = 1.5;

/// Information weight on localizer observation edges (isotropic, 1/0.1).
const LOCALIZER_INFORMATION: f64 = 1.0 / 0.1;

/// A current-cone candidate must be within this range to be walked past (m).
const CURRENT_CONE_RANGE: f64 = 10.0;

/// Bearing magnitude beyond which a cone is behind the beam (degrees).
const BEHIND_BEAM_DEG: f64 = 80.0;

/// Coarse heading search.
///
/// Sweeps candidate headings across ±45° of the odometry heading in 2°
/// steps, reprojecting the frame at each candidate and scoring it by the
/// summed distance from each cone to its nearest map neighbour. The best
/// candidate is the argmin among those with at least [`MIN_FITTED`] cones
/// fitting within [`FIT_DISTANCE`]; it is accepted only if its summed error
/// stays below [`MAX_SUM_ERROR`]. Degenerate frames (≤ 2 cones) and failed
/// sweeps keep the odometry heading.
pub fn optimize_heading(
    frame: &Frame,
    pose: &Pose2,
    map: &[Cone],
    lidar_dist_to_cog: f64,
) -> f64 {
    if frame.cones.len() <= 2 {
        return pose.theta;
    }

    let neighbourhood: Vec<&Cone> = map
        .iter()
        .filter(|cone| cone.distance_from(pose) < NEIGHBOURHOOD_RANGE)
        .collect();
    if neighbourhood.is_empty() {
        return pose.theta;
    }

    let mut best_heading = pose.theta;
    let mut best_sum_error = f64::INFINITY;

    let mut candidate = pose.theta - SWEEP_HALF_RANGE;
    while candidate < pose.theta + SWEEP_HALF_RANGE {
        let candidate_pose = Pose2::new(pose.x, pose.y, candidate);
        let mut sum_error = 0.0;
        let mut fitted = 0;
        for reading in &frame.cones {
            let global = cone_to_global(
                &candidate_pose,
                reading.azimuth_deg,
                reading.zenith_deg,
                reading.range,
                lidar_dist_to_cog,
            );
            let minimum = neighbourhood
                .iter()
                .map(|cone| (cone.best_position() - global).norm())
                .fold(f64::INFINITY, f64::min);
            sum_error += minimum;
            if minimum < FIT_DISTANCE {
                fitted += 1;
            }
        }
        if fitted >= MIN_FITTED && sum_error < best_sum_error {
            best_sum_error = sum_error;
            best_heading = candidate;
        }
        candidate += SWEEP_STEP;
    }

    if best_sum_error < MAX_SUM_ERROR {
        trace!(
            heading = best_heading,
            error = best_sum_error,
            "heading sweep accepted"
        );
        best_heading
    } else {
        pose.theta
    }
}

/// Associates frame cones against the frozen map.
///
/// Linear scan in map order; the first cone within [`MATCH_DISTANCE`] of the
/// reprojected observation wins. Returns `(map index, local observation)`
/// pairs.
pub fn match_against_map(
    frame: &Frame,
    pose: &Pose2,
    map: &[Cone],
    lidar_dist_to_cog: f64,
) -> Vec<(usize, Vector2<f64>)> {
    let mut matches = Vec::new();
    for reading in &frame.cones {
        let global = cone_to_global(
            pose,
            reading.azimuth_deg,
            reading.zenith_deg,
            reading.range,
            lidar_dist_to_cog,
        );
        if !global.x.is_finite() || !global.y.is_finite() {
            continue;
        }
        for (index, cone) in map.iter().enumerate() {
            if (cone.best_position() - global).norm() < MATCH_DISTANCE {
                let local = spherical_to_cartesian(
                    reading.azimuth_deg,
                    reading.zenith_deg,
                    reading.range,
                    lidar_dist_to_cog,
                )
                .xy();
                matches.push((index, local));
                break;
            }
        }
    }
    matches
}

/// One localization step against the frozen map.
///
/// `pose` must already carry the sweep-corrected heading. With three or more
/// map matches a two-layer graph is solved: one free SE(2) vertex for the
/// vehicle against fixed landmark vertices at the matched cones' optimized
/// positions. With fewer matches (or a degenerate solve) the input pose is
/// the answer.
pub fn localize(
    frame: &Frame,
    pose: &Pose2,
    map: &[Cone],
    lidar_dist_to_cog: f64,
) -> Pose2 {
    let matches = match_against_map(frame, pose, map, lidar_dist_to_cog);
    if matches.len() < MIN_FITTED {
        return *pose;
    }

    let mut graph = PoseGraph::new();
    let information = Matrix2::identity() * LOCALIZER_INFORMATION;
    let build = (|| {
        graph.add_pose(POSE_VERTEX_OFFSET, *pose)?;
        for (vertex_id, (map_index, local)) in matches.iter().enumerate() {
            graph.add_landmark(vertex_id, map[*map_index].best_position())?;
            graph.fix_vertex(vertex_id)?;
            graph.add_observation_edge(POSE_VERTEX_OFFSET, vertex_id, *local, information)?;
        }
        graph.optimize(GAUSS_NEWTON_ITERATIONS)
    })();

    match build {
        Ok(chi2) => {
            let solved = graph.read_pose(POSE_VERTEX_OFFSET).unwrap_or(*pose);
            debug!(
                matches = matches.len(),
                chi2,
                x = solved.x,
                y = solved.y,
                "localized against map"
            );
            solved
        }
        Err(error) => {
            debug!(%error, "localization solve failed, keeping odometry pose");
            *pose
        }
    }
}

/// Advances the current-cone index past cones the vehicle has left behind.
///
/// A cone is behind the beam when it is within [`CURRENT_CONE_RANGE`] and
/// its bearing magnitude exceeds [`BEHIND_BEAM_DEG`] degrees. Walks forward
/// at most `map.len()` hops, wrapping at the end of the map.
pub fn update_current_cone(pose: &Pose2, map: &[Cone], start: usize) -> usize {
    if map.is_empty() {
        return 0;
    }
    let mut index = start % map.len();
    for _ in 0..map.len() {
        let cone = &map[index];
        let behind = cone.distance_from(pose) < CURRENT_CONE_RANGE
            && cone.bearing_from_deg(pose).abs() > BEHIND_BEAM_DEG;
        if !behind {
            break;
        }
        index = (index + 1) % map.len();
    }
    index
}
