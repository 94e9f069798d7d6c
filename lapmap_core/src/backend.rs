//! Graph construction for the two optimization passes.
//!
//! The windowed ("essential") pass keeps latency bounded during mapping by
//! optimizing only the poses connected to a recent span of cones; the full
//! bundle adjustment runs once, at loop closure, over everything. Both build
//! on the [`PoseGraph`] backend and write their results back in place.

use crate::cone::Cone;
use crate::geometry::Pose2;
use crate::graph::{GraphError, PoseGraph, GAUSS_NEWTON_ITERATIONS, POSE_VERTEX_OFFSET};
use nalgebra::{Matrix2, Matrix3};
use tracing::debug;

/// Information weight of one odometry edge (isotropic, 1/0.5).
pub const ODOMETRY_INFORMATION: f64 = 1.0 / 0.5;

/// Adds the pose chain `[first, last]` with consecutive odometry edges.
///
/// Each edge measures the relative pose between neighbours as currently
/// estimated, so the chain is self-consistent at insertion.
fn add_pose_chain(
    graph: &mut PoseGraph,
    poses: &[Pose2],
    first: usize,
    last: usize,
) -> Result<(), GraphError> {
    for index in first..=last {
        graph.add_pose(POSE_VERTEX_OFFSET + index, poses[index])?;
        if index > first {
            let measurement = poses[index - 1].relative_to(&poses[index]);
            graph.add_odometry_edge(
                POSE_VERTEX_OFFSET + index - 1,
                POSE_VERTEX_OFFSET + index,
                measurement,
                Matrix3::identity() * ODOMETRY_INFORMATION,
            )?;
        }
    }
    Ok(())
}

/// Adds one cone as a landmark vertex plus its observation edges.
///
/// The vertex seeds from the optimized position when one exists, otherwise
/// from the freshly recomputed observation mean. The information matrix is
/// the inverse per-axis spread of the cone's global samples.
fn add_cone(graph: &mut PoseGraph, cone: &mut Cone) -> Result<(), GraphError> {
    if !cone.is_optimized() {
        cone.calculate_mean();
    }
    graph.add_landmark(cone.id(), cone.best_position())?;

    let covariance = cone.covariance();
    let information = Matrix2::new(1.0 / covariance.x, 0.0, 0.0, 1.0 / covariance.y);
    for observation in cone.observations() {
        graph.add_observation_edge(
            POSE_VERTEX_OFFSET + observation.pose_index,
            cone.id(),
            observation.local,
            information,
        )?;
    }
    Ok(())
}

/// Windowed optimization over the cone-id span `[start, end]`.
///
/// Builds a fresh graph holding every pose connected to a cone in the span
/// (padded to a contiguous pose range), anchors the earliest pose, runs
/// Gauss–Newton and writes the refined poses and cone positions back.
pub fn optimize_essential_graph(
    cones: &mut [Cone],
    poses: &mut [Pose2],
    start: usize,
    end: usize,
) -> Result<(), GraphError> {
    let mut connected: Vec<usize> = Vec::new();
    for cone in &cones[start..=end] {
        connected.extend(cone.observations().iter().map(|o| o.pose_index));
    }
    let (Some(&first), Some(&last)) = (connected.iter().min(), connected.iter().max()) else {
        return Ok(());
    };

    let mut graph = PoseGraph::new();
    add_pose_chain(&mut graph, poses, first, last)?;
    for cone in &mut cones[start..=end] {
        add_cone(&mut graph, cone)?;
    }
    graph.fix_vertex(POSE_VERTEX_OFFSET + first)?;

    let chi2 = graph.optimize(GAUSS_NEWTON_ITERATIONS)?;
    debug!(
        cones = end - start + 1,
        poses = last - first + 1,
        chi2,
        "essential graph optimized"
    );

    for index in first..=last {
        if let Some(pose) = graph.read_pose(POSE_VERTEX_OFFSET + index) {
            poses[index] = pose;
        }
    }
    for cone in &mut cones[start..=end] {
        if let Some(position) = graph.read_landmark(cone.id()) {
            cone.set_optimized(position);
        }
    }
    Ok(())
}

/// The one-shot global optimization at loop closure.
///
/// Rebuilds the shared optimizer with every pose and every cone, anchors the
/// first pose only, and writes everything back.
pub fn full_bundle_adjustment(
    graph: &mut PoseGraph,
    cones: &mut [Cone],
    poses: &mut [Pose2],
) -> Result<(), GraphError> {
    if poses.is_empty() || cones.is_empty() {
        return Ok(());
    }

    graph.clear();
    add_pose_chain(graph, poses, 0, poses.len() - 1)?;
    for cone in cones.iter_mut() {
        add_cone(graph, cone)?;
    }
    graph.fix_vertex(POSE_VERTEX_OFFSET)?;

    let chi2 = graph.optimize(GAUSS_NEWTON_ITERATIONS)?;
    debug!(
        cones = cones.len(),
        poses = poses.len(),
        chi2,
        "full bundle adjustment finished"
    );

    for (index, pose) in poses.iter_mut().enumerate() {
        if let Some(updated) = graph.read_pose(POSE_VERTEX_OFFSET + index) {
            *pose = updated;
        }
    }
    for cone in cones.iter_mut() {
        if let Some(position) = graph.read_landmark(cone.id()) {
            cone.set_optimized(position);
        }
    }
    Ok(())
}
