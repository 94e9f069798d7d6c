//! Ground-truth circuit oracle.
//!
//! Maintains the God's-eye view of a closed circular circuit: the true cone
//! positions lining both track edges, the true vehicle state driving the
//! centerline, and the synthesis of every sensor stream the engine consumes
//! (odometry fix, ground speed, yaw rate, cone bundle), each with seeded
//! noise.

use lapmap_core::cone::{KIND_LEFT, KIND_RIGHT};
use lapmap_core::geometry::{wrap_angle, Pose2};
use lapmap_core::messages::{
    ConeBundle, ConePackage, GeolocationReading, ObjectDirection, ObjectDistance, ObjectKind,
};
use nalgebra::Vector2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Circuit and sensor parameters.
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Centerline radius of the circular circuit (m).
    pub radius: f64,
    /// Distance between the left and right cone rows (m).
    pub track_width: f64,
    /// Number of cone pairs around the circuit.
    pub cone_pairs: usize,
    /// Vehicle speed along the centerline (m/s).
    pub speed: f64,
    /// Lidar detection range (m).
    pub sensor_range: f64,
    /// Lidar half field of view (degrees).
    pub fov_half_deg: f64,
    /// Longitudinal lidar offset ahead of the CoG (m).
    pub lidar_dist_to_cog: f64,
    /// Odometry position noise, 1σ (m).
    pub position_noise: f64,
    /// Odometry heading noise, 1σ (rad).
    pub heading_noise: f64,
    /// Lidar range noise, 1σ (m).
    pub range_noise: f64,
    /// Lidar azimuth noise, 1σ (degrees).
    pub azimuth_noise: f64,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            radius: 20.0,
            track_width: 3.0,
            cone_pairs: 15,
            speed: 10.0,
            sensor_range: 12.0,
            fov_half_deg: 100.0,
            lidar_dist_to_cog: 1.5,
            position_noise: 0.05,
            heading_noise: 0.01,
            range_noise: 0.05,
            azimuth_noise: 0.3,
        }
    }
}

/// One ground-truth cone.
#[derive(Debug, Clone, Copy)]
pub struct TrueCone {
    pub position: Vector2<f64>,
    pub kind: i32,
}

/// The oracle: true world state plus noisy sensor synthesis.
pub struct TrackOracle {
    config: TrackConfig,
    rng: ChaCha8Rng,
    cones: Vec<TrueCone>,
    /// Vehicle arc angle along the centerline (rad, counterclockwise).
    arc: f64,
    time: f64,
}

impl TrackOracle {
    pub fn new(seed: u64, config: TrackConfig) -> Self {
        let mut cones = Vec::with_capacity(config.cone_pairs * 2);
        let half_width = config.track_width / 2.0;
        for pair in 0..config.cone_pairs {
            let angle = pair as f64 / config.cone_pairs as f64 * std::f64::consts::TAU;
            let (sin_a, cos_a) = angle.sin_cos();
            // Driving counterclockwise: the inner edge is on the left.
            cones.push(TrueCone {
                position: Vector2::new(
                    (config.radius - half_width) * cos_a,
                    (config.radius - half_width) * sin_a,
                ),
                kind: KIND_LEFT,
            });
            cones.push(TrueCone {
                position: Vector2::new(
                    (config.radius + half_width) * cos_a,
                    (config.radius + half_width) * sin_a,
                ),
                kind: KIND_RIGHT,
            });
        }
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            cones,
            arc: 0.0,
            time: 0.0,
        }
    }

    /// Advances the vehicle by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.arc += self.config.speed / self.config.radius * dt;
        self.time += dt;
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Completed laps so far.
    pub fn laps(&self) -> f64 {
        self.arc / std::f64::consts::TAU
    }

    /// The true vehicle pose (CoG) on the centerline.
    pub fn true_pose(&self) -> Pose2 {
        let (sin_a, cos_a) = self.arc.sin_cos();
        Pose2::new(
            self.config.radius * cos_a,
            self.config.radius * sin_a,
            wrap_angle(self.arc + std::f64::consts::FRAC_PI_2),
        )
    }

    pub fn cones(&self) -> &[TrueCone] {
        &self.cones
    }

    /// A noisy odometry fix in local Cartesian convention
    /// (longitude = x, latitude = y).
    pub fn odometry_reading(&mut self) -> GeolocationReading {
        let pose = self.true_pose();
        let position_noise = Normal::new(0.0, self.config.position_noise).unwrap();
        let heading_noise = Normal::new(0.0, self.config.heading_noise).unwrap();
        GeolocationReading {
            longitude: pose.x + position_noise.sample(&mut self.rng),
            latitude: pose.y + position_noise.sample(&mut self.rng),
            heading: wrap_angle(pose.theta + heading_noise.sample(&mut self.rng)),
        }
    }

    /// Ground speed with sensor jitter.
    pub fn ground_speed(&mut self) -> f64 {
        let noise = Normal::new(0.0, 0.05).unwrap();
        self.config.speed + noise.sample(&mut self.rng)
    }

    /// Yaw rate of the circular drive with sensor jitter.
    pub fn yaw_rate(&mut self) -> f64 {
        let noise = Normal::new(0.0, 0.01).unwrap();
        self.config.speed / self.config.radius + noise.sample(&mut self.rng)
    }

    /// The cone bundle the perception front-end would deliver right now.
    ///
    /// Cones within sensor range and field of view of the lidar, keyed by a
    /// per-sweep object id, with seeded range/azimuth noise.
    pub fn cone_bundle(&mut self) -> ConeBundle {
        let pose = self.true_pose();
        let (sin_t, cos_t) = pose.theta.sin_cos();
        let lidar = Vector2::new(
            pose.x + self.config.lidar_dist_to_cog * cos_t,
            pose.y + self.config.lidar_dist_to_cog * sin_t,
        );
        let range_noise = Normal::new(0.0, self.config.range_noise).unwrap();
        let azimuth_noise = Normal::new(0.0, self.config.azimuth_noise).unwrap();

        let mut bundle = ConeBundle::new();
        let mut object_id = 0u32;
        for cone in &self.cones {
            let offset = cone.position - lidar;
            let range = offset.norm();
            if range > self.config.sensor_range {
                continue;
            }
            let azimuth_deg =
                wrap_angle(offset.y.atan2(offset.x) - pose.theta).to_degrees();
            if azimuth_deg.abs() > self.config.fov_half_deg {
                continue;
            }
            bundle.insert(
                object_id,
                ConePackage {
                    direction: ObjectDirection {
                        object_id,
                        azimuth_deg: azimuth_deg + azimuth_noise.sample(&mut self.rng),
                        zenith_deg: 0.0,
                    },
                    distance: ObjectDistance {
                        object_id,
                        range: (range + range_noise.sample(&mut self.rng)).max(0.1),
                    },
                    kind: ObjectKind {
                        object_id,
                        kind: cone.kind,
                    },
                },
            );
            object_id += 1;
        }
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cones_line_both_edges() {
        let oracle = TrackOracle::new(7, TrackConfig::default());
        assert_eq!(oracle.cones().len(), 30);
        let left = oracle.cones().iter().filter(|c| c.kind == KIND_LEFT).count();
        assert_eq!(left, 15);
    }

    #[test]
    fn vehicle_drives_the_centerline() {
        let mut oracle = TrackOracle::new(7, TrackConfig::default());
        let start = oracle.true_pose();
        assert!((start.translation().norm() - 20.0).abs() < 1e-9);

        // A quarter lap later the vehicle is 90° around the circle.
        let quarter_lap = std::f64::consts::TAU * 20.0 / 4.0 / 10.0;
        oracle.step(quarter_lap);
        let pose = oracle.true_pose();
        assert!((pose.translation().norm() - 20.0).abs() < 1e-9);
        assert!(pose.x.abs() < 1e-6);
        assert!((oracle.laps() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn bundle_sees_cones_ahead_only() {
        let mut oracle = TrackOracle::new(7, TrackConfig::default());
        let bundle = oracle.cone_bundle();
        assert!(!bundle.is_empty());
        for package in bundle.values() {
            assert!(package.distance.range <= 12.0 + 0.5);
            assert!(package.direction.azimuth_deg.abs() <= 100.0 + 2.0);
        }
    }

    #[test]
    fn sensor_noise_is_seeded() {
        let mut a = TrackOracle::new(7, TrackConfig::default());
        let mut b = TrackOracle::new(7, TrackConfig::default());
        assert_eq!(a.odometry_reading(), b.odometry_reading());
        assert_eq!(a.cone_bundle(), b.cone_bundle());
    }
}
