//! The SLAM engine record.
//!
//! One [`SlamEngine`] owns every piece of mutable state behind per-domain
//! locks and exposes the message entry points the bus invokes, possibly
//! concurrently. SLAM work itself runs on whichever thread delivers the cone
//! frame; there is no internal work queue.
//!
//! Lock ordering, strictly descending, is sensor → map → send; the optimizer
//! and phase locks nest innermost. The map lock is deliberately held across
//! the full bundle adjustment so concurrent readers observe either the
//! pre-closure or the post-closure map, never an intermediate one.

use crate::backend;
use crate::config::SlamConfig;
use crate::cone::Cone;
use crate::filter::filter_map;
use crate::frame::{Frame, FrameAssembler, KeyframeGate, ObjectMessage};
use crate::geometry::{wgs84_to_cartesian, wrap_angle, Pose2};
use crate::graph::PoseGraph;
use crate::localizer;
use crate::mapping::ConeMap;
use crate::messages::{
    AngularVelocityReading, ConeBundle, GeolocationReading, GroundSpeedReading,
    NorthHeadingReading, ObjectDirection, ObjectDistance, ObjectKind, OutboundMessage,
    SwitchStateReading, Wgs84Reading,
};
use crate::persistence;
use lapmap_env::{Clock, MessageSink, Timestamp};
use parking_lot::Mutex;
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Readiness-loop wake interval.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlamPhase {
    /// Waiting for the sensor gates and the state machine.
    Init,
    /// Armed; no keyframe processed yet.
    Ready,
    /// Building the map during the first lap.
    Mapping,
    /// Running the loop-closure bundle adjustment.
    Closing,
    /// Running the one-shot map filter.
    Filtering,
    /// Terminal: localizing against the frozen map.
    Localizing,
}

/// The odometry-side mutable state (sensor domain).
#[derive(Debug, Default)]
struct SensorState {
    odometry: Pose2,
    geolocation_received: Timestamp,
    poses: Vec<Pose2>,
}

/// Sample counters behind the readiness gate.
///
/// GPS counts samples where both coordinates moved by more than a millimetre
/// while staying inside a sane 200 m radius of the reference; the inertial
/// side counts ground-speed and heading changes. Stale or frozen sensors
/// never satisfy the gate.
#[derive(Debug)]
struct ReadyProbe {
    last_x: f64,
    last_y: f64,
    valid_gps: u32,
    gps_ready: bool,
    last_speed: f64,
    last_heading: f64,
    valid_speed: u32,
    valid_heading: u32,
    imu_ready: bool,
}

impl Default for ReadyProbe {
    fn default() -> Self {
        Self {
            last_x: 100_000.0,
            last_y: 100_000.0,
            valid_gps: 0,
            gps_ready: false,
            last_speed: 100_000.0,
            last_heading: 100_000.0,
            valid_speed: 0,
            valid_heading: 0,
            imu_ready: false,
        }
    }
}

impl ReadyProbe {
    fn observe(&mut self, odometry: &Pose2, ground_speed: f64) -> bool {
        if !self.gps_ready {
            if (odometry.x - self.last_x).abs() > 0.001
                && (odometry.y - self.last_y).abs() > 0.001
                && odometry.x.abs() < 200.0
                && odometry.y.abs() < 200.0
            {
                self.last_x = odometry.x;
                self.last_y = odometry.y;
                self.valid_gps += 1;
            }
            if self.valid_gps > 5 {
                self.gps_ready = true;
                info!("gps ready");
            }
        }
        if !self.imu_ready {
            if (ground_speed - self.last_speed).abs() > 0.001 {
                self.last_speed = ground_speed;
                self.valid_speed += 1;
            }
            if (odometry.theta - self.last_heading).abs() > 0.001 {
                self.last_heading = odometry.theta;
                self.valid_heading += 1;
            }
            if self.valid_speed > 30 && self.valid_heading > 30 {
                self.imu_ready = true;
                info!("imu ready");
            }
        }
        self.gps_ready && self.imu_ready
    }
}

/// The mapping-and-localization core.
///
/// Generic over the clock and the outbound sink so production and
/// simulation drive the identical engine.
pub struct SlamEngine<C, S> {
    config: SlamConfig,
    clock: Arc<C>,
    sink: Arc<S>,

    sensor: Mutex<SensorState>,
    map: Mutex<ConeMap>,
    send_pose: Mutex<Pose2>,
    optimizer: Mutex<PoseGraph>,
    yaw_rate: Mutex<f64>,
    ground_speed: Mutex<f64>,

    assembler: Mutex<FrameAssembler>,
    keyframe_gate: Mutex<KeyframeGate>,
    ready_probe: Mutex<ReadyProbe>,
    phase: Mutex<SlamPhase>,
    /// Sample time of the newest cone frame, stamped onto outbound cones.
    last_frame_time: Mutex<Timestamp>,

    machine_ready: AtomicBool,
    internal_ready: AtomicBool,
    loop_closed: AtomicBool,
    shutdown: AtomicBool,
}

impl<C, S> SlamEngine<C, S>
where
    C: Clock,
    S: MessageSink<OutboundMessage>,
{
    pub fn new(config: SlamConfig, clock: Arc<C>, sink: Arc<S>) -> Self {
        let assembler = FrameAssembler::new(config.gathering_time_ms);
        let keyframe_gate = KeyframeGate::new(config.time_between_keyframes_ms);
        Self {
            config,
            clock,
            sink,
            sensor: Mutex::new(SensorState::default()),
            map: Mutex::new(ConeMap::new()),
            send_pose: Mutex::new(Pose2::default()),
            optimizer: Mutex::new(PoseGraph::new()),
            yaw_rate: Mutex::new(0.0),
            ground_speed: Mutex::new(0.0),
            assembler: Mutex::new(assembler),
            keyframe_gate: Mutex::new(keyframe_gate),
            ready_probe: Mutex::new(ReadyProbe::default()),
            phase: Mutex::new(SlamPhase::Init),
            last_frame_time: Mutex::new(Timestamp::default()),
            machine_ready: AtomicBool::new(false),
            internal_ready: AtomicBool::new(false),
            loop_closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    // ===== Inbound message entry points =====

    /// Combined odometry: position plus heading in one message.
    pub fn handle_geolocation(&self, reading: GeolocationReading, sample_time: Timestamp) {
        let mut sensor = self.sensor.lock();
        sensor.geolocation_received = sample_time;
        if self.config.gps_coords {
            let [x, y] = wgs84_to_cartesian(
                [self.config.ref_latitude, self.config.ref_longitude],
                [reading.latitude, reading.longitude],
            );
            sensor.odometry = Pose2::new(x, y, reading.heading);
        } else {
            sensor.odometry = Pose2::new(reading.longitude, reading.latitude, reading.heading);
        }
    }

    /// Split-path position fix.
    pub fn handle_wgs84(&self, reading: Wgs84Reading, _sample_time: Timestamp) {
        let mut sensor = self.sensor.lock();
        let [x, y] = wgs84_to_cartesian(
            [self.config.ref_latitude, self.config.ref_longitude],
            [reading.latitude, reading.longitude],
        );
        sensor.odometry.x = x;
        sensor.odometry.y = y;
    }

    /// Split-path heading fix: north-referenced, rotated into the track
    /// frame and wrapped.
    pub fn handle_north_heading(&self, reading: NorthHeadingReading, _sample_time: Timestamp) {
        let mut sensor = self.sensor.lock();
        sensor.odometry.theta = wrap_angle(reading.north_heading - PI);
    }

    pub fn handle_yaw_rate(&self, reading: AngularVelocityReading, _sample_time: Timestamp) {
        *self.yaw_rate.lock() = reading.angular_velocity_z;
    }

    pub fn handle_ground_speed(&self, reading: GroundSpeedReading, _sample_time: Timestamp) {
        *self.ground_speed.lock() = reading.ground_speed;
    }

    /// State-machine broadcast; state 2 arms the engine.
    pub fn handle_switch_state(&self, reading: SwitchStateReading) {
        if reading.state == 2 {
            self.machine_ready.store(true, Ordering::SeqCst);
            info!("state machine armed");
        }
    }

    /// Loose per-object perception message (older flow).
    pub fn handle_object_message(&self, message: ObjectMessage, sample_time: Timestamp) {
        let frame = self.assembler.lock().push(message, sample_time);
        if let Some(frame) = frame {
            self.ingest_frame(frame);
        }
    }

    /// Pre-grouped perception packet (newer flow).
    pub fn handle_cone_bundle(&self, sample_time: Timestamp, bundle: &ConeBundle) {
        self.ingest_frame(Frame::from_bundle(sample_time, bundle));
    }

    fn ingest_frame(&self, frame: Frame) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        *self.last_frame_time.lock() = frame.stamp;
        let now = self.clock.now();
        if self.keyframe_gate.lock().admit(now) {
            self.perform_slam(frame);
        }
    }

    // ===== Readiness =====

    /// One observation step of the readiness gate.
    ///
    /// Returns whether the internal gate has passed.
    pub fn poll_ready(&self) -> bool {
        if self.internal_ready.load(Ordering::SeqCst) {
            return true;
        }
        let (odometry, ground_speed) = {
            let sensor = self.sensor.lock();
            (sensor.odometry, *self.ground_speed.lock())
        };
        let done = self.ready_probe.lock().observe(&odometry, ground_speed);
        if done {
            self.internal_ready.store(true, Ordering::SeqCst);
            let mut phase = self.phase.lock();
            if *phase == SlamPhase::Init && self.machine_ready.load(Ordering::SeqCst) {
                *phase = SlamPhase::Ready;
            }
            info!("sensor ready check done");
        }
        done
    }

    /// Blocks until the sensor gate passes, polling every 50 ms.
    ///
    /// Meant for a dedicated background thread; returns early on shutdown.
    pub fn run_ready_loop(&self) {
        while !self.shutdown.load(Ordering::SeqCst) && !self.poll_ready() {
            self.clock.sleep(READY_POLL_INTERVAL);
        }
    }

    /// Both gates: stable sensors and an armed state machine.
    pub fn is_ready(&self) -> bool {
        self.internal_ready.load(Ordering::SeqCst) && self.machine_ready.load(Ordering::SeqCst)
    }

    /// Requests cooperative shutdown; checked at message boundaries.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    // ===== The keyframe pipeline =====

    fn perform_slam(&self, frame: Frame) {
        if !self.is_ready() {
            return;
        }
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, SlamPhase::Init | SlamPhase::Ready) {
                *phase = SlamPhase::Mapping;
                info!("first keyframe, mapping started");
            }
        }

        let (pose, pose_index) = {
            let mut sensor = self.sensor.lock();
            let pose = sensor.odometry;
            sensor.poses.push(pose);
            (pose, sensor.poses.len() - 1)
        };

        if !self.loop_closed.load(Ordering::SeqCst) {
            {
                let mut map = self.map.lock();
                map.associate_frame(&frame, &pose, pose_index, &self.config);
            }
            self.run_windowed_optimization();
            self.try_close_loop();
        }

        if self.loop_closed.load(Ordering::SeqCst) {
            self.run_localizer(&frame, &pose);
            self.publish_pose();
            self.publish_cones();
        }
    }

    /// Windowed optimization over the latest span of new cones, when due.
    fn run_windowed_optimization(&self) {
        let mut sensor = self.sensor.lock();
        let mut map = self.map.lock();
        let Some((start, end)) = map.due_essential_window() else {
            return;
        };
        debug!(start, end, "running windowed optimization");
        if let Err(error) =
            backend::optimize_essential_graph(map.cone_list_mut(), &mut sensor.poses, start, end)
        {
            // Capped Gauss-Newton, no retry: keep the last estimates.
            warn!(%error, "windowed optimization failed");
        }
        map.record_essential_span(start, end);
        map.advance_cone_ref();
    }

    /// Full bundle adjustment plus map filtering once a lap has accumulated.
    fn try_close_loop(&self) {
        let mut sensor = self.sensor.lock();
        let mut map = self.map.lock();
        if !map.lap_completed(self.config.lap_size) {
            return;
        }

        *self.phase.lock() = SlamPhase::Closing;
        info!(
            cones = map.cone_list().len(),
            poses = sensor.poses.len(),
            advance = map.cone_advance(),
            "lap complete, closing loop"
        );
        {
            let mut optimizer = self.optimizer.lock();
            if let Err(error) =
                backend::full_bundle_adjustment(&mut optimizer, map.cone_list_mut(), &mut sensor.poses)
            {
                warn!(%error, "full bundle adjustment failed");
            }
        }
        self.loop_closed.store(true, Ordering::SeqCst);

        *self.phase.lock() = SlamPhase::Filtering;
        filter_map(
            map.cone_list_mut(),
            &sensor.poses,
            self.config.same_cone_threshold,
        );
        map.freeze_map();

        *self.phase.lock() = SlamPhase::Localizing;
        info!(map_size = map.map().len(), "map frozen, localizing from here");
    }

    /// Heading correction, map matching and the pose-only solve.
    fn run_localizer(&self, frame: &Frame, pose: &Pose2) {
        let corrected = {
            let mut map = self.map.lock();
            if map.map().is_empty() {
                *pose
            } else {
                let heading = localizer::optimize_heading(
                    frame,
                    pose,
                    map.map(),
                    self.config.lidar_dist_to_cog,
                );
                let heading_pose = Pose2::new(pose.x, pose.y, heading);
                let advanced = localizer::update_current_cone(
                    &heading_pose,
                    map.map(),
                    map.current_cone_index(),
                );
                map.set_current_cone_index(advanced);
                localizer::localize(
                    frame,
                    &heading_pose,
                    map.map(),
                    self.config.lidar_dist_to_cog,
                )
            }
        };
        *self.send_pose.lock() = corrected;
    }

    // ===== Outbound =====

    fn publish_pose(&self) {
        let sample_time = self.sensor.lock().geolocation_received;
        if self.map.lock().map().is_empty() {
            return;
        }
        let pose = *self.send_pose.lock();
        let message = OutboundMessage::Pose(GeolocationReading {
            longitude: pose.x,
            latitude: pose.y,
            heading: pose.theta,
        });
        if let Err(error) = self.sink.send(message, sample_time, self.config.sender_stamp) {
            warn!(%error, "dropping outbound pose");
        }
    }

    /// Publishes the window of upcoming cones starting at the current cone.
    ///
    /// Cone i of the packet carries object id `conesPerPacket − 1 − i`, so
    /// the nearest upcoming cone has the largest id.
    fn publish_cones(&self) {
        let pose = *self.send_pose.lock();
        let map = self.map.lock();
        if map.map().is_empty() {
            return;
        }
        let sample_time = *self.last_frame_time.lock();
        let packet = self.config.cones_per_packet;
        for (i, cone) in map.upcoming_cones(packet as usize).enumerate() {
            let object_id = packet - 1 - i as u32;

            let messages = [
                OutboundMessage::Direction(ObjectDirection {
                    object_id,
                    azimuth_deg: cone.bearing_from_deg(&pose),
                    zenith_deg: 0.0,
                }),
                OutboundMessage::Distance(ObjectDistance {
                    object_id,
                    range: cone.distance_from(&pose),
                }),
                OutboundMessage::Kind(ObjectKind {
                    object_id,
                    kind: cone.kind(),
                }),
            ];
            for message in messages {
                if let Err(error) =
                    self.sink.send(message, sample_time, self.config.sender_stamp)
                {
                    warn!(%error, "dropping outbound cone");
                }
            }
        }
    }

    // ===== Debug snapshots =====

    pub fn phase(&self) -> SlamPhase {
        *self.phase.lock()
    }

    pub fn loop_closed(&self) -> bool {
        self.loop_closed.load(Ordering::SeqCst)
    }

    pub fn snapshot_poses(&self) -> Vec<Pose2> {
        self.sensor.lock().poses.clone()
    }

    pub fn snapshot_cone_list(&self) -> Vec<Cone> {
        self.map.lock().cone_list().to_vec()
    }

    pub fn snapshot_map(&self) -> Vec<Cone> {
        self.map.lock().map().to_vec()
    }

    pub fn snapshot_essential_map(&self) -> Vec<Cone> {
        self.map.lock().essential_map().to_vec()
    }

    pub fn current_cone_index(&self) -> usize {
        self.map.lock().current_cone_index()
    }

    /// The best pose available right now: the localizer output once the
    /// loop is closed, raw odometry before.
    pub fn current_pose(&self) -> Pose2 {
        if self.loop_closed.load(Ordering::SeqCst) {
            *self.send_pose.lock()
        } else {
            self.sensor.lock().odometry
        }
    }

    pub fn yaw_rate(&self) -> f64 {
        *self.yaw_rate.lock()
    }

    pub fn ground_speed(&self) -> f64 {
        *self.ground_speed.lock()
    }

    /// Dumps `map.txt` and `pose.txt` into `directory`.
    pub fn save_debug_files(&self, directory: &Path) -> std::io::Result<()> {
        let poses = self.snapshot_poses();
        let map = self.snapshot_map();
        persistence::write_map_file(&directory.join("map.txt"), &map)?;
        persistence::write_pose_file(&directory.join("pose.txt"), &poses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ConePackage, ObjectDirection, ObjectDistance, ObjectKind};
    use approx::assert_relative_eq;
    use lapmap_env::{BufferSink, ManualClock};

    type TestEngine = SlamEngine<ManualClock, BufferSink<OutboundMessage>>;

    fn test_engine_with(
        config: SlamConfig,
    ) -> (Arc<TestEngine>, Arc<ManualClock>, Arc<BufferSink<OutboundMessage>>) {
        let clock = Arc::new(ManualClock::starting_at(Timestamp::from_micros(0)));
        let sink = Arc::new(BufferSink::new());
        let engine = Arc::new(SlamEngine::new(config, clock.clone(), sink.clone()));
        (engine, clock, sink)
    }

    fn test_engine() -> (Arc<TestEngine>, Arc<ManualClock>, Arc<BufferSink<OutboundMessage>>) {
        test_engine_with(SlamConfig::default())
    }

    /// The lidar reading a vehicle at `pose` would report for a cone at
    /// `global`, as `(azimuth_deg, range)`. Cones ahead of the CoG only.
    fn reading_toward(pose: &Pose2, global: (f64, f64)) -> (f64, f64) {
        let local = pose.to_local(&nalgebra::Vector2::new(global.0, global.1));
        let from_lidar = local - nalgebra::Vector2::new(1.5, 0.0);
        (
            from_lidar.y.atan2(from_lidar.x).to_degrees(),
            from_lidar.norm(),
        )
    }

    /// Walks the engine through the readiness gate with moving sensors.
    fn arm(engine: &TestEngine, clock: &ManualClock) {
        engine.handle_switch_state(SwitchStateReading { state: 2 });
        for i in 0..40 {
            let wobble = 0.01 * (i + 1) as f64;
            engine.handle_geolocation(
                GeolocationReading {
                    longitude: wobble,
                    latitude: wobble,
                    heading: wobble / 5.0,
                },
                clock.now(),
            );
            engine.handle_ground_speed(
                GroundSpeedReading {
                    ground_speed: 2.0 + wobble,
                },
                clock.now(),
            );
            engine.poll_ready();
            clock.advance(Duration::from_millis(50));
        }
        assert!(engine.is_ready(), "gate should have passed");
    }

    fn bundle_of(cones: &[(f64, f64, i32)]) -> ConeBundle {
        let mut bundle = ConeBundle::new();
        for (i, &(azimuth_deg, range, kind)) in cones.iter().enumerate() {
            let object_id = i as u32;
            bundle.insert(
                object_id,
                ConePackage {
                    direction: ObjectDirection {
                        object_id,
                        azimuth_deg,
                        zenith_deg: 0.0,
                    },
                    distance: ObjectDistance { object_id, range },
                    kind: ObjectKind { object_id, kind },
                },
            );
        }
        bundle
    }

    fn send_keyframe(engine: &TestEngine, clock: &ManualClock, cones: &[(f64, f64, i32)]) {
        clock.advance(Duration::from_millis(150));
        engine.handle_cone_bundle(clock.now(), &bundle_of(cones));
    }

    #[test]
    fn not_ready_engine_ignores_frames() {
        let (engine, clock, _) = test_engine();
        engine.handle_cone_bundle(clock.now(), &bundle_of(&[(0.0, 2.0, 1)]));
        assert!(engine.snapshot_cone_list().is_empty());
        assert!(engine.snapshot_poses().is_empty());
        assert_eq!(engine.phase(), SlamPhase::Init);
    }

    #[test]
    fn single_cone_single_pose() {
        let (engine, clock, _) = test_engine();
        arm(&engine, &clock);
        engine.handle_geolocation(
            GeolocationReading {
                longitude: 0.0,
                latitude: 0.0,
                heading: 0.0,
            },
            clock.now(),
        );

        send_keyframe(&engine, &clock, &[(0.0, 2.0, 1)]);

        let cones = engine.snapshot_cone_list();
        assert_eq!(cones.len(), 1);
        assert_eq!(cones[0].kind(), 1);
        // 2 m ahead of the lidar is 3.5 m ahead of the CoG.
        assert_relative_eq!(cones[0].mean_position().x, 3.5, epsilon = 1e-9);
        assert_relative_eq!(cones[0].mean_position().y, 0.0, epsilon = 1e-9);
        assert_eq!(engine.snapshot_poses().len(), 1);
        assert_eq!(engine.phase(), SlamPhase::Mapping);
    }

    #[test]
    fn keyframe_gate_drops_fast_frames() {
        let (engine, clock, _) = test_engine();
        arm(&engine, &clock);

        send_keyframe(&engine, &clock, &[(0.0, 2.0, 1)]);
        // Within the keyframe interval: not ingested.
        clock.advance(Duration::from_millis(10));
        engine.handle_cone_bundle(clock.now(), &bundle_of(&[(0.0, 2.0, 1)]));
        assert_eq!(engine.snapshot_poses().len(), 1);

        send_keyframe(&engine, &clock, &[(0.0, 2.0, 1)]);
        assert_eq!(engine.snapshot_poses().len(), 2);
    }

    #[test]
    fn association_accumulates_observations() {
        let (engine, clock, _) = test_engine();
        arm(&engine, &clock);
        engine.handle_geolocation(
            GeolocationReading {
                longitude: 0.0,
                latitude: 0.0,
                heading: 0.0,
            },
            clock.now(),
        );

        send_keyframe(&engine, &clock, &[(0.0, 2.0, 1)]);
        send_keyframe(&engine, &clock, &[(0.0, 2.05, 1)]);

        let cones = engine.snapshot_cone_list();
        assert_eq!(cones.len(), 1);
        assert_eq!(cones[0].observation_count(), 2);
    }

    #[test]
    fn windowed_optimization_marks_cones() {
        let (engine, clock, _) = test_engine();
        arm(&engine, &clock);

        // March the vehicle forward past a fresh cone each keyframe until
        // the window trigger fires.
        for i in 0..12 {
            engine.handle_geolocation(
                GeolocationReading {
                    longitude: i as f64 * 2.0,
                    latitude: 0.0,
                    heading: 0.0,
                },
                clock.now(),
            );
            send_keyframe(&engine, &clock, &[(20.0, 4.0, 1)]);
        }

        let cones = engine.snapshot_cone_list();
        assert!(cones.len() >= 10, "built {} cones", cones.len());
        let optimized = cones.iter().filter(|c| c.is_optimized()).count();
        assert!(optimized >= 10, "only {optimized} optimized");
        assert!(!engine.snapshot_essential_map().is_empty());
    }

    #[test]
    fn zero_cone_keyframe_after_closure_echoes_odometry() {
        // A lane of cones passed one per keyframe clears a tiny lap
        // threshold quickly, so the whole closure path runs without a
        // simulated circuit.
        let config = SlamConfig {
            lap_size: 3,
            ..SlamConfig::default()
        };
        let (engine, clock, _) = test_engine_with(config);
        arm(&engine, &clock);

        let lane: Vec<(f64, f64)> = (0..10).map(|j| (2.0 + 2.0 * j as f64, 1.5)).collect();
        for i in 0..5 {
            let pose = Pose2::new(2.0 * i as f64, 0.0, 0.0);
            engine.handle_geolocation(
                GeolocationReading {
                    longitude: pose.x,
                    latitude: pose.y,
                    heading: 0.0,
                },
                clock.now(),
            );
            let visible: Vec<(f64, f64, i32)> = lane
                .iter()
                .map(|&cone| reading_toward(&pose, cone))
                .filter(|&(azimuth_deg, range)| azimuth_deg.abs() < 75.0 && range < 9.2)
                .map(|(azimuth_deg, range)| (azimuth_deg, range, 1))
                .collect();
            send_keyframe(&engine, &clock, &visible);
        }

        assert!(engine.loop_closed(), "lap threshold never cleared");
        assert_eq!(engine.phase(), SlamPhase::Localizing);
        assert!(!engine.snapshot_map().is_empty());

        // A keyframe with zero cones: the published pose must be exactly
        // the odometry pose fed in.
        let odometry = GeolocationReading {
            longitude: 3.25,
            latitude: -1.5,
            heading: 0.4,
        };
        engine.handle_geolocation(odometry, clock.now());
        send_keyframe(&engine, &clock, &[]);

        let pose = engine.current_pose();
        assert_eq!(pose.x, odometry.longitude);
        assert_eq!(pose.y, odometry.latitude);
        assert_eq!(pose.theta, odometry.heading);
    }

    #[test]
    fn split_path_updates_odometry() {
        let (engine, clock, _) = test_engine();
        engine.handle_wgs84(
            Wgs84Reading {
                latitude: 0.0,
                longitude: 0.0,
            },
            clock.now(),
        );
        engine.handle_north_heading(
            NorthHeadingReading {
                north_heading: PI + 0.25,
            },
            clock.now(),
        );
        let pose = engine.current_pose();
        assert_relative_eq!(pose.x, 0.0);
        assert_relative_eq!(pose.theta, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn inertial_readings_are_stored() {
        let (engine, clock, _) = test_engine();
        engine.handle_yaw_rate(
            AngularVelocityReading {
                angular_velocity_z: 0.4,
            },
            clock.now(),
        );
        engine.handle_ground_speed(GroundSpeedReading { ground_speed: 7.5 }, clock.now());
        assert_relative_eq!(engine.yaw_rate(), 0.4);
        assert_relative_eq!(engine.ground_speed(), 7.5);
    }

    #[test]
    fn shutdown_stops_ingest() {
        let (engine, clock, _) = test_engine();
        arm(&engine, &clock);
        engine.request_shutdown();
        send_keyframe(&engine, &clock, &[(0.0, 2.0, 1)]);
        assert!(engine.snapshot_poses().is_empty());
    }
}
