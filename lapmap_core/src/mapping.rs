//! Data association and incremental map building.
//!
//! [`ConeMap`] is the map domain: the working cone list built during the
//! first lap, the frozen global map after loop closure, the current-cone
//! index tracking where along the circuit the vehicle is, and the
//! accumulated cone advance that detects lap completion.

use crate::cone::Cone;
use crate::config::SlamConfig;
use crate::frame::Frame;
use crate::geometry::{cone_to_global, spherical_to_cartesian, Pose2};
use tracing::{debug, trace};

/// The mutable map domain of the engine.
#[derive(Debug, Default)]
pub struct ConeMap {
    /// Working cone list (CL). Ids are dense; id equals position.
    cone_list: Vec<Cone>,
    /// Frozen global map (M), populated once at loop closure.
    map: Vec<Cone>,
    /// Cones that passed through windowed optimization, for debug readers.
    essential_map: Vec<Cone>,
    /// Index of the cone the vehicle is nearest to (into CL, or M once
    /// frozen).
    current_cone_index: usize,
    /// Total signed advance of the current-cone index since start (Δcc).
    cone_advance: i64,
    /// Start of the next windowed-optimization window.
    cone_ref: usize,
}

/// New cones trigger a windowed optimization once this many accumulated.
pub const ESSENTIAL_WINDOW: usize = 10;

impl ConeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches one keyframe's cones against the working list, appending
    /// observations to known cones and creating cones for new sightings
    /// within mapping range.
    ///
    /// The first frame of a session only seeds cone 0 from its first column;
    /// association starts with the second frame.
    pub fn associate_frame(
        &mut self,
        frame: &Frame,
        pose: &Pose2,
        pose_index: usize,
        config: &SlamConfig,
    ) {
        let old_index = self.current_cone_index;
        let mut nearest_index = old_index;
        let mut first_cone = false;

        if self.cone_list.is_empty() {
            if let Some(reading) = frame.cones.first() {
                let local = spherical_to_cartesian(
                    reading.azimuth_deg,
                    reading.zenith_deg,
                    reading.range,
                    config.lidar_dist_to_cog,
                )
                .xy();
                let global = pose.to_global(&local);
                let mut cone = Cone::new(global.x, global.y, reading.kind, 0);
                cone.add_observation(local, global, pose_index, old_index);
                self.cone_list.push(cone);
                first_cone = true;
                trace!(x = global.x, y = global.y, kind = reading.kind, "seeded first cone");
            }
        }

        let mut min_distance = 100.0;
        for reading in &frame.cones {
            if first_cone {
                break;
            }
            let distance_to_car = reading.range;
            let local = spherical_to_cartesian(
                reading.azimuth_deg,
                reading.zenith_deg,
                reading.range,
                config.lidar_dist_to_cog,
            )
            .xy();
            let global = cone_to_global(
                pose,
                reading.azimuth_deg,
                reading.zenith_deg,
                reading.range,
                config.lidar_dist_to_cog,
            );
            // Malformed column: drop it, keep the frame.
            if !global.x.is_finite() || !global.y.is_finite() {
                continue;
            }

            let mut found = false;
            for j in 0..self.cone_list.len() {
                if self.cone_list[j].kind() != reading.kind {
                    continue;
                }
                self.cone_list[j].calculate_mean();
                let separation = (self.cone_list[j].mean_position() - global).norm();
                if separation < config.same_cone_threshold {
                    found = true;
                    self.cone_list[j].add_observation(local, global, pose_index, old_index);
                    if distance_to_car < min_distance
                        && distance_to_car < config.cone_mapping_threshold
                    {
                        nearest_index = j;
                        min_distance = distance_to_car;
                    }
                    break;
                }
            }

            if !found && distance_to_car < config.cone_mapping_threshold {
                let id = self.cone_list.len();
                let mut cone = Cone::new(global.x, global.y, reading.kind, id);
                cone.add_observation(local, global, pose_index, old_index);
                self.cone_list.push(cone);
            }
        }

        let delta = nearest_index as i64 - old_index as i64;
        self.cone_advance += delta;
        self.current_cone_index = nearest_index;
        if delta != 0 {
            debug!(
                current_cone = self.current_cone_index,
                advance = self.cone_advance,
                "current cone moved"
            );
        }
    }

    /// The window for the next essential optimization, if one is due.
    ///
    /// Returns the inclusive cone-id span `[cone_ref, |CL|−1]` once
    /// [`ESSENTIAL_WINDOW`] new cones have accumulated.
    pub fn due_essential_window(&self) -> Option<(usize, usize)> {
        let len = self.cone_list.len();
        if len - self.cone_ref >= ESSENTIAL_WINDOW {
            Some((self.cone_ref, len - 1))
        } else {
            None
        }
    }

    /// Moves the windowed-optimization reference to the end of the list.
    pub fn advance_cone_ref(&mut self) {
        self.cone_ref = self.cone_list.len().saturating_sub(1);
    }

    /// Whether the accumulated cone advance amounts to a full lap.
    pub fn lap_completed(&self, lap_size: i64) -> bool {
        self.cone_advance > lap_size
    }

    /// Copies the still-valid cones of the working list into the frozen
    /// global map and rewinds the current-cone index to the start line.
    pub fn freeze_map(&mut self) {
        self.map = self
            .cone_list
            .iter()
            .filter(|c| c.is_valid())
            .cloned()
            .collect();
        self.current_cone_index = 0;
        debug!(
            map = self.map.len(),
            raw = self.cone_list.len(),
            "global map frozen"
        );
    }

    /// Appends copies of a cone-id span to the essential-map debug store.
    pub fn record_essential_span(&mut self, start: usize, end: usize) {
        for cone in &self.cone_list[start..=end] {
            self.essential_map.push(cone.clone());
        }
    }

    /// At most `count` upcoming cones starting at the current cone,
    /// wrapping at the end of the frozen map.
    pub fn upcoming_cones(&self, count: usize) -> impl Iterator<Item = &Cone> {
        self.map
            .iter()
            .cycle()
            .skip(self.current_cone_index)
            .take(count)
    }

    // ===== Accessors =====

    pub fn cone_list(&self) -> &[Cone] {
        &self.cone_list
    }

    pub fn cone_list_mut(&mut self) -> &mut [Cone] {
        &mut self.cone_list
    }

    pub fn map(&self) -> &[Cone] {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut [Cone] {
        &mut self.map
    }

    pub fn essential_map(&self) -> &[Cone] {
        &self.essential_map
    }

    pub fn current_cone_index(&self) -> usize {
        self.current_cone_index
    }

    pub fn set_current_cone_index(&mut self, index: usize) {
        self.current_cone_index = index;
    }

    pub fn cone_advance(&self) -> i64 {
        self.cone_advance
    }
}
