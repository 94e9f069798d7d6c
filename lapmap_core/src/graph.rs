//! The optimization backend.
//!
//! A two-layer factor graph over SE(2) pose vertices and 2-D landmark
//! vertices, with relative-pose odometry edges and pose→landmark observation
//! edges. Solved by Gauss–Newton on the normal equations with a Cholesky
//! factorization; the graphs here stay at one-lap scale (a few hundred
//! variables), where the dense solve is far from the budget. Swapping in a
//! sparse solver only touches [`PoseGraph::optimize`].
//!
//! Vertex ids follow the pipeline-wide convention: landmark ids are the cone
//! ids (dense from 0), pose ids live at [`POSE_VERTEX_OFFSET`] + pose index,
//! and the two ranges must not overlap.

use crate::geometry::{wrap_angle, Pose2};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Vector2, Vector3};
use std::collections::BTreeMap;
use thiserror::Error;

/// First vertex id reserved for poses; cone ids must stay below it.
pub const POSE_VERTEX_OFFSET: usize = 1000;

/// Gauss–Newton iteration count used by every optimization in the pipeline.
pub const GAUSS_NEWTON_ITERATIONS: usize = 10;

#[derive(Debug, Clone)]
struct PoseVertex {
    estimate: Pose2,
    fixed: bool,
}

#[derive(Debug, Clone)]
struct LandmarkVertex {
    estimate: Vector2<f64>,
    fixed: bool,
}

#[derive(Debug, Clone)]
struct OdometryEdge {
    from: usize,
    to: usize,
    measurement: Pose2,
    information: Matrix3<f64>,
}

#[derive(Debug, Clone)]
struct ObservationEdge {
    pose: usize,
    landmark: usize,
    measurement: Vector2<f64>,
    information: Matrix2<f64>,
}

/// Errors raised by graph construction or the solve.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("Vertex id {0} is outside its range (cones < {POSE_VERTEX_OFFSET} <= poses)")]
    IdOutOfRange(usize),

    #[error("Unknown vertex id {0}")]
    UnknownVertex(usize),

    #[error("Duplicate vertex id {0}")]
    DuplicateVertex(usize),

    #[error("Normal equations are not positive definite")]
    SingularSystem,
}

/// A pose-landmark factor graph with a Gauss–Newton solve.
#[derive(Debug, Default)]
pub struct PoseGraph {
    poses: BTreeMap<usize, PoseVertex>,
    landmarks: BTreeMap<usize, LandmarkVertex>,
    odometry_edges: Vec<OdometryEdge>,
    observation_edges: Vec<ObservationEdge>,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all vertices and edges, keeping the allocation.
    pub fn clear(&mut self) {
        self.poses.clear();
        self.landmarks.clear();
        self.odometry_edges.clear();
        self.observation_edges.clear();
    }

    /// Adds an SE(2) pose vertex with id `POSE_VERTEX_OFFSET + index`.
    pub fn add_pose(&mut self, id: usize, estimate: Pose2) -> Result<(), GraphError> {
        if id < POSE_VERTEX_OFFSET {
            return Err(GraphError::IdOutOfRange(id));
        }
        if self.poses.contains_key(&id) {
            return Err(GraphError::DuplicateVertex(id));
        }
        self.poses.insert(
            id,
            PoseVertex {
                estimate,
                fixed: false,
            },
        );
        Ok(())
    }

    /// Adds a 2-D landmark vertex with the cone id as vertex id.
    pub fn add_landmark(&mut self, id: usize, estimate: Vector2<f64>) -> Result<(), GraphError> {
        if id >= POSE_VERTEX_OFFSET {
            return Err(GraphError::IdOutOfRange(id));
        }
        if self.landmarks.contains_key(&id) {
            return Err(GraphError::DuplicateVertex(id));
        }
        self.landmarks.insert(
            id,
            LandmarkVertex {
                estimate,
                fixed: false,
            },
        );
        Ok(())
    }

    /// Adds a relative-SE(2) edge between two pose vertices.
    ///
    /// The measurement is the pose of `to` expressed in the frame of `from`.
    pub fn add_odometry_edge(
        &mut self,
        from: usize,
        to: usize,
        measurement: Pose2,
        information: Matrix3<f64>,
    ) -> Result<(), GraphError> {
        for id in [from, to] {
            if !self.poses.contains_key(&id) {
                return Err(GraphError::UnknownVertex(id));
            }
        }
        self.odometry_edges.push(OdometryEdge {
            from,
            to,
            measurement,
            information,
        });
        Ok(())
    }

    /// Adds a pose→landmark edge.
    ///
    /// The measurement is the landmark in the pose's vehicle frame.
    pub fn add_observation_edge(
        &mut self,
        pose: usize,
        landmark: usize,
        measurement: Vector2<f64>,
        information: Matrix2<f64>,
    ) -> Result<(), GraphError> {
        if !self.poses.contains_key(&pose) {
            return Err(GraphError::UnknownVertex(pose));
        }
        if !self.landmarks.contains_key(&landmark) {
            return Err(GraphError::UnknownVertex(landmark));
        }
        self.observation_edges.push(ObservationEdge {
            pose,
            landmark,
            measurement,
            information,
        });
        Ok(())
    }

    /// Pins a vertex so the solve cannot move it.
    pub fn fix_vertex(&mut self, id: usize) -> Result<(), GraphError> {
        if let Some(pose) = self.poses.get_mut(&id) {
            pose.fixed = true;
            return Ok(());
        }
        if let Some(landmark) = self.landmarks.get_mut(&id) {
            landmark.fixed = true;
            return Ok(());
        }
        Err(GraphError::UnknownVertex(id))
    }

    /// Current estimate of a pose vertex.
    pub fn read_pose(&self, id: usize) -> Option<Pose2> {
        self.poses.get(&id).map(|v| v.estimate)
    }

    /// Current estimate of a landmark vertex.
    pub fn read_landmark(&self, id: usize) -> Option<Vector2<f64>> {
        self.landmarks.get(&id).map(|v| v.estimate)
    }

    pub fn pose_count(&self) -> usize {
        self.poses.len()
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.odometry_edges.len() + self.observation_edges.len()
    }

    /// Runs Gauss–Newton for at most `iterations` rounds.
    ///
    /// Returns the final summed chi² over all edges. A failed Cholesky
    /// factorization aborts the remaining rounds; estimates from completed
    /// rounds stand (there is no retry at this level).
    pub fn optimize(&mut self, iterations: usize) -> Result<f64, GraphError> {
        let (slots, free_dims) = self.assign_slots();
        if free_dims == 0 {
            return Ok(self.chi2());
        }

        for round in 0..iterations {
            let mut h = DMatrix::<f64>::zeros(free_dims, free_dims);
            let mut b = DVector::<f64>::zeros(free_dims);

            self.accumulate_odometry(&slots, &mut h, &mut b);
            self.accumulate_observations(&slots, &mut h, &mut b);

            let delta = match h.cholesky() {
                Some(factor) => factor.solve(&(-b)),
                None => {
                    // Degenerate system (e.g. nothing anchors the gauge).
                    // Keep whatever the earlier rounds produced.
                    if round == 0 {
                        return Err(GraphError::SingularSystem);
                    }
                    break;
                }
            };

            self.apply_delta(&slots, &delta);
        }

        Ok(self.chi2())
    }

    /// Maps free vertices to their column offsets in the reduced system.
    fn assign_slots(&self) -> (BTreeMap<usize, usize>, usize) {
        let mut slots = BTreeMap::new();
        let mut offset = 0;
        for (&id, vertex) in &self.poses {
            if !vertex.fixed {
                slots.insert(id, offset);
                offset += 3;
            }
        }
        for (&id, vertex) in &self.landmarks {
            if !vertex.fixed {
                slots.insert(id, offset);
                offset += 2;
            }
        }
        (slots, offset)
    }

    fn accumulate_odometry(
        &self,
        slots: &BTreeMap<usize, usize>,
        h: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
    ) {
        for edge in &self.odometry_edges {
            let xi = self.poses[&edge.from].estimate;
            let xj = self.poses[&edge.to].estimate;

            let predicted = xi.relative_to(&xj);
            let error = Vector3::new(
                predicted.x - edge.measurement.x,
                predicted.y - edge.measurement.y,
                wrap_angle(predicted.theta - edge.measurement.theta),
            );

            let (sin_i, cos_i) = xi.theta.sin_cos();
            let rot_i_t = Matrix2::new(cos_i, sin_i, -sin_i, cos_i);
            let drot_i_t = Matrix2::new(-sin_i, cos_i, -cos_i, -sin_i);
            let dt = Vector2::new(xj.x - xi.x, xj.y - xi.y);
            let dtheta = drot_i_t * dt;

            // d error / d (xi, yi, thetai)
            let mut jac_i = Matrix3::zeros();
            jac_i.fixed_view_mut::<2, 2>(0, 0).copy_from(&(-rot_i_t));
            jac_i.fixed_view_mut::<2, 1>(0, 2).copy_from(&dtheta);
            jac_i[(2, 2)] = -1.0;

            // d error / d (xj, yj, thetaj)
            let mut jac_j = Matrix3::zeros();
            jac_j.fixed_view_mut::<2, 2>(0, 0).copy_from(&rot_i_t);
            jac_j[(2, 2)] = 1.0;

            let omega = edge.information;
            let slot_i = slots.get(&edge.from).copied();
            let slot_j = slots.get(&edge.to).copied();

            if let Some(si) = slot_i {
                add_block(h, si, si, &(jac_i.transpose() * omega * jac_i));
                add_vec(b, si, &(jac_i.transpose() * omega * error));
            }
            if let Some(sj) = slot_j {
                add_block(h, sj, sj, &(jac_j.transpose() * omega * jac_j));
                add_vec(b, sj, &(jac_j.transpose() * omega * error));
            }
            if let (Some(si), Some(sj)) = (slot_i, slot_j) {
                let cross = jac_i.transpose() * omega * jac_j;
                add_block(h, si, sj, &cross);
                add_block(h, sj, si, &cross.transpose());
            }
        }
    }

    fn accumulate_observations(
        &self,
        slots: &BTreeMap<usize, usize>,
        h: &mut DMatrix<f64>,
        b: &mut DVector<f64>,
    ) {
        for edge in &self.observation_edges {
            let pose = self.poses[&edge.pose].estimate;
            let landmark = self.landmarks[&edge.landmark].estimate;

            let predicted = pose.to_local(&landmark);
            let error = predicted - edge.measurement;

            let (sin_t, cos_t) = pose.theta.sin_cos();
            let rot_t = Matrix2::new(cos_t, sin_t, -sin_t, cos_t);
            let drot_t = Matrix2::new(-sin_t, cos_t, -cos_t, -sin_t);
            let dt = landmark - pose.translation();

            // d error / d (x, y, theta) of the pose
            let mut jac_pose = nalgebra::Matrix2x3::zeros();
            jac_pose.fixed_view_mut::<2, 2>(0, 0).copy_from(&(-rot_t));
            jac_pose.fixed_view_mut::<2, 1>(0, 2).copy_from(&(drot_t * dt));

            // d error / d landmark
            let jac_lm = rot_t;

            let omega = edge.information;
            let slot_p = slots.get(&edge.pose).copied();
            let slot_l = slots.get(&edge.landmark).copied();

            if let Some(sp) = slot_p {
                add_block(h, sp, sp, &(jac_pose.transpose() * omega * jac_pose));
                add_vec(b, sp, &(jac_pose.transpose() * omega * error));
            }
            if let Some(sl) = slot_l {
                add_block(h, sl, sl, &(jac_lm.transpose() * omega * jac_lm));
                add_vec(b, sl, &(jac_lm.transpose() * omega * error));
            }
            if let (Some(sp), Some(sl)) = (slot_p, slot_l) {
                let cross = jac_pose.transpose() * omega * jac_lm;
                add_block(h, sp, sl, &cross);
                add_block(h, sl, sp, &cross.transpose());
            }
        }
    }

    fn apply_delta(&mut self, slots: &BTreeMap<usize, usize>, delta: &DVector<f64>) {
        for (&id, &slot) in slots {
            if let Some(vertex) = self.poses.get_mut(&id) {
                vertex.estimate.x += delta[slot];
                vertex.estimate.y += delta[slot + 1];
                vertex.estimate.theta = wrap_angle(vertex.estimate.theta + delta[slot + 2]);
            } else if let Some(vertex) = self.landmarks.get_mut(&id) {
                vertex.estimate.x += delta[slot];
                vertex.estimate.y += delta[slot + 1];
            }
        }
    }

    /// Summed weighted squared error over all edges.
    pub fn chi2(&self) -> f64 {
        let mut total = 0.0;
        for edge in &self.odometry_edges {
            let xi = self.poses[&edge.from].estimate;
            let xj = self.poses[&edge.to].estimate;
            let predicted = xi.relative_to(&xj);
            let error = Vector3::new(
                predicted.x - edge.measurement.x,
                predicted.y - edge.measurement.y,
                wrap_angle(predicted.theta - edge.measurement.theta),
            );
            total += (error.transpose() * edge.information * error)[(0, 0)];
        }
        for edge in &self.observation_edges {
            let pose = self.poses[&edge.pose].estimate;
            let landmark = self.landmarks[&edge.landmark].estimate;
            let error = pose.to_local(&landmark) - edge.measurement;
            total += (error.transpose() * edge.information * error)[(0, 0)];
        }
        total
    }
}

fn add_block<R: nalgebra::Dim, C: nalgebra::Dim, S>(
    h: &mut DMatrix<f64>,
    row: usize,
    col: usize,
    block: &nalgebra::Matrix<f64, R, C, S>,
) where
    S: nalgebra::storage::Storage<f64, R, C>,
{
    for r in 0..block.nrows() {
        for c in 0..block.ncols() {
            h[(row + r, col + c)] += block[(r, c)];
        }
    }
}

fn add_vec<R: nalgebra::Dim, S>(
    b: &mut DVector<f64>,
    offset: usize,
    v: &nalgebra::Matrix<f64, R, nalgebra::U1, S>,
) where
    S: nalgebra::storage::Storage<f64, R, nalgebra::U1>,
{
    for r in 0..v.nrows() {
        b[offset + r] += v[r];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn observation_of(pose: &Pose2, landmark: &Vector2<f64>) -> Vector2<f64> {
        pose.to_local(landmark)
    }

    #[test]
    fn id_ranges_are_enforced() {
        let mut graph = PoseGraph::new();
        assert!(matches!(
            graph.add_pose(3, Pose2::default()),
            Err(GraphError::IdOutOfRange(3))
        ));
        assert!(matches!(
            graph.add_landmark(POSE_VERTEX_OFFSET, Vector2::zeros()),
            Err(GraphError::IdOutOfRange(_))
        ));
        graph.add_pose(POSE_VERTEX_OFFSET, Pose2::default()).unwrap();
        assert!(matches!(
            graph.add_pose(POSE_VERTEX_OFFSET, Pose2::default()),
            Err(GraphError::DuplicateVertex(_))
        ));
    }

    #[test]
    fn fixed_pose_does_not_move() {
        let mut graph = PoseGraph::new();
        let anchor = Pose2::new(1.0, 2.0, 0.5);
        graph.add_pose(1000, anchor).unwrap();
        graph.add_landmark(0, Vector2::new(4.0, 1.0)).unwrap();
        graph.fix_vertex(1000).unwrap();
        graph
            .add_observation_edge(
                1000,
                0,
                observation_of(&anchor, &Vector2::new(5.0, 1.5)),
                Matrix2::identity(),
            )
            .unwrap();

        graph.optimize(GAUSS_NEWTON_ITERATIONS).unwrap();

        let pose = graph.read_pose(1000).unwrap();
        assert_relative_eq!(pose.x, anchor.x);
        assert_relative_eq!(pose.y, anchor.y);
        assert_relative_eq!(pose.theta, anchor.theta);
        // The free landmark moved onto the measurement.
        let lm = graph.read_landmark(0).unwrap();
        assert_relative_eq!(lm.x, 5.0, epsilon = 1e-9);
        assert_relative_eq!(lm.y, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn consistent_graph_converges_to_ground_truth() {
        // Ground truth: three poses along an arc, two landmarks.
        let truth_poses = [
            Pose2::new(0.0, 0.0, 0.0),
            Pose2::new(2.0, 0.2, 0.2),
            Pose2::new(3.8, 0.9, 0.45),
        ];
        let truth_landmarks = [Vector2::new(3.0, 2.0), Vector2::new(6.0, 1.0)];

        let mut graph = PoseGraph::new();
        // Initial guesses are perturbed; the first pose anchors the gauge.
        graph.add_pose(1000, truth_poses[0]).unwrap();
        graph
            .add_pose(1001, Pose2::new(2.3, -0.1, 0.1))
            .unwrap();
        graph.add_pose(1002, Pose2::new(3.2, 1.4, 0.6)).unwrap();
        graph.fix_vertex(1000).unwrap();
        graph.add_landmark(0, Vector2::new(2.5, 2.5)).unwrap();
        graph.add_landmark(1, Vector2::new(6.5, 0.5)).unwrap();

        let info_odo = Matrix3::identity() * 2.0;
        for i in 0..2 {
            graph
                .add_odometry_edge(
                    1000 + i,
                    1001 + i,
                    truth_poses[i].relative_to(&truth_poses[i + 1]),
                    info_odo,
                )
                .unwrap();
        }
        let info_obs = Matrix2::identity() * 10.0;
        for (pose_id, pose) in truth_poses.iter().enumerate() {
            for (lm_id, lm) in truth_landmarks.iter().enumerate() {
                graph
                    .add_observation_edge(1000 + pose_id, lm_id, observation_of(pose, lm), info_obs)
                    .unwrap();
            }
        }

        let chi2 = graph.optimize(GAUSS_NEWTON_ITERATIONS).unwrap();
        assert!(chi2 < 1e-12, "chi2 = {chi2}");

        for (i, truth) in truth_poses.iter().enumerate() {
            let pose = graph.read_pose(1000 + i).unwrap();
            assert_relative_eq!(pose.x, truth.x, epsilon = 1e-6);
            assert_relative_eq!(pose.y, truth.y, epsilon = 1e-6);
            assert_relative_eq!(pose.theta, truth.theta, epsilon = 1e-6);
        }
        for (i, truth) in truth_landmarks.iter().enumerate() {
            let lm = graph.read_landmark(i).unwrap();
            assert_relative_eq!(lm.x, truth.x, epsilon = 1e-6);
            assert_relative_eq!(lm.y, truth.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn unanchored_graph_reports_singular_system() {
        // Two poses, one relative measurement, nothing fixed: the gauge is
        // free and the normal equations cannot be positive definite.
        let mut graph = PoseGraph::new();
        graph.add_pose(1000, Pose2::default()).unwrap();
        graph.add_pose(1001, Pose2::new(1.0, 0.0, 0.0)).unwrap();
        graph
            .add_odometry_edge(1000, 1001, Pose2::new(1.0, 0.0, 0.0), Matrix3::identity())
            .unwrap();

        assert!(matches!(
            graph.optimize(GAUSS_NEWTON_ITERATIONS),
            Err(GraphError::SingularSystem)
        ));
    }

    #[test]
    fn all_fixed_graph_is_a_no_op() {
        let mut graph = PoseGraph::new();
        graph.add_pose(1000, Pose2::default()).unwrap();
        graph.fix_vertex(1000).unwrap();
        let chi2 = graph.optimize(GAUSS_NEWTON_ITERATIONS).unwrap();
        assert_relative_eq!(chi2, 0.0);
    }
}
