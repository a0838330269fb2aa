//! Sensor-based odometry with collision-aware integration.
//!
//! The estimator integrates wheel motion into an (x, y, θ) pose, constrains
//! the position to the room plan, and appends every change to the JSON-lines
//! history so a restart resumes from the last persisted pose.
//!
//! # Integration Sources
//!
//! - **encoders** (default): wrap-safe u16 tick deltas × `mm_per_tick`,
//!   differential-drive kinematics over a 235 mm wheelbase.
//! - **distance**: the OI one-frame distance/angle fields.
//!
//! Rotation always integrates (turning in place is never constrained);
//! translation passes through the sliding collision clamp.
//!
//! # Concurrency
//!
//! A single writer thread owns every mutation (sensor frames arrive on a
//! no-drop channel); readers clone the state under a read lock.

pub mod history;

use crate::config::{Config, OdometrySource};
use crate::error::Result;
use crate::geometry::{normalize_deg, shortest_arc_deg, CollisionMap, Point, Pose};
use crate::oi::SensorSnapshot;
use history::{HistoryRecord, JsonlHistoryStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

/// Wheel separation of the 700-series drive base, millimetres.
const WHEEL_BASE_MM: f64 = 235.0;

/// Pose plus the step that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseUpdate {
    pub pose: Pose,
    /// Translation applied in this step, millimetres (after clamping).
    pub distance_mm: f64,
    /// Rotation applied in this step, degrees.
    pub angle_deg: f64,
}

/// Odometry estimator. Single-writer; see module docs.
pub struct OdometryEstimator {
    pose: Pose,
    last_distance_mm: f64,
    last_angle_deg: f64,

    source: OdometrySource,
    mm_per_tick: f64,
    linear_scale: f64,
    angular_scale: f64,

    last_left_counts: Option<u16>,
    last_right_counts: Option<u16>,
    last_total_distance_mm: Option<f64>,
    last_total_angle_deg: Option<f64>,

    collision: Option<CollisionMap>,
    history: Option<Arc<JsonlHistoryStore>>,
}

impl OdometryEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            pose: Pose::default(),
            last_distance_mm: 0.0,
            last_angle_deg: 0.0,
            source: config.odometry_source,
            mm_per_tick: config.odometry_mm_per_tick,
            linear_scale: config.odometry_linear_scale,
            angular_scale: config.odometry_angular_scale,
            last_left_counts: None,
            last_right_counts: None,
            last_total_distance_mm: None,
            last_total_angle_deg: None,
            collision: None,
            history: None,
        }
    }

    /// Attach the collision model built from the active plan.
    pub fn set_collision_map(&mut self, map: Option<CollisionMap>) {
        self.collision = map;
    }

    /// Attach the persistent history sink.
    pub fn set_history(&mut self, history: Arc<JsonlHistoryStore>) {
        self.history = Some(history);
    }

    /// Current pose and the last step deltas.
    pub fn current(&self) -> PoseUpdate {
        PoseUpdate {
            pose: self.pose,
            distance_mm: self.last_distance_mm,
            angle_deg: self.last_angle_deg,
        }
    }

    /// Hard-set the pose and re-anchor all sensor baselines so the next
    /// frame does not produce a spurious jump.
    pub fn reset_to(&mut self, pose: Pose) {
        self.pose = Pose::new(pose.x_mm, pose.y_mm, pose.theta_deg);
        self.last_left_counts = None;
        self.last_right_counts = None;
        self.last_total_distance_mm = None;
        self.last_total_angle_deg = None;
        self.last_distance_mm = 0.0;
        self.last_angle_deg = 0.0;
        self.write_history(HistoryRecord::reset(self.pose));
    }

    /// Truncate the history file and restart it at `pose`.
    pub fn reset_history(&mut self, pose: Pose) -> Result<()> {
        if let Some(history) = &self.history {
            history.clear()?;
        }
        self.reset_to(pose);
        Ok(())
    }

    /// Integrate one sensor frame.
    pub fn update_from_snapshot(&mut self, snapshot: &SensorSnapshot) -> PoseUpdate {
        match self.source {
            OdometrySource::Encoders => self.update_from_encoders(snapshot),
            OdometrySource::Distance => self.update_from_distance(snapshot),
        }
    }

    fn update_from_encoders(&mut self, snapshot: &SensorSnapshot) -> PoseUpdate {
        let (dl, dr) = self.consume_encoder_deltas(snapshot);

        // Wheels slip against whatever the bumper is touching; the counted
        // ticks do not correspond to travel.
        if snapshot.any_bump() {
            self.last_distance_mm = 0.0;
            self.last_angle_deg = 0.0;
            return self.current();
        }

        if dl == 0 && dr == 0 {
            self.last_distance_mm = 0.0;
            self.last_angle_deg = 0.0;
            return self.current();
        }

        let s_left = dl as f64 * self.mm_per_tick * self.linear_scale;
        let s_right = dr as f64 * self.mm_per_tick * self.linear_scale;
        let distance = (s_left + s_right) * 0.5;
        let dtheta_deg =
            ((s_right - s_left) / WHEEL_BASE_MM * self.angular_scale).to_degrees();

        self.integrate(distance, dtheta_deg, "encoders")
    }

    fn update_from_distance(&mut self, snapshot: &SensorSnapshot) -> PoseUpdate {
        let total_distance = snapshot.total_distance_mm;
        let total_angle = snapshot.total_angle_deg;

        let (Some(base_distance), Some(base_angle)) =
            (self.last_total_distance_mm, self.last_total_angle_deg)
        else {
            self.last_total_distance_mm = Some(total_distance);
            self.last_total_angle_deg = Some(total_angle);
            self.last_distance_mm = 0.0;
            self.last_angle_deg = 0.0;
            return self.current();
        };

        let distance = (total_distance - base_distance) * self.linear_scale;
        let dtheta_deg = (total_angle - base_angle) * self.angular_scale;
        self.last_total_distance_mm = Some(total_distance);
        self.last_total_angle_deg = Some(total_angle);

        if distance == 0.0 && dtheta_deg == 0.0 {
            self.last_distance_mm = 0.0;
            self.last_angle_deg = 0.0;
            return self.current();
        }

        self.integrate(distance, dtheta_deg, "distance")
    }

    /// Apply a (distance, rotation) step: heading first, then the clamped
    /// translation along the new heading.
    fn integrate(&mut self, distance_mm: f64, dtheta_deg: f64, source: &str) -> PoseUpdate {
        let theta = normalize_deg(self.pose.theta_deg + dtheta_deg);
        let rad = theta.to_radians();
        let from = self.pose.position();
        let candidate = Point::new(
            from.x + distance_mm * rad.cos(),
            from.y + distance_mm * rad.sin(),
        );
        let accepted = self.clamp_position(from, candidate);

        let applied = from.distance(accepted);
        let applied = if distance_mm < 0.0 { -applied } else { applied };

        self.pose = Pose::new(accepted.x, accepted.y, theta);
        self.last_distance_mm = applied;
        self.last_angle_deg = dtheta_deg;

        if applied != 0.0 || dtheta_deg != 0.0 {
            self.write_history(HistoryRecord::update(self.pose, source, applied, dtheta_deg));
        }
        self.current()
    }

    fn clamp_position(&self, from: Point, candidate: Point) -> Point {
        match &self.collision {
            Some(map) => map.clamp_step(from, candidate),
            None => candidate,
        }
    }

    /// Blend toward a fiducial-derived target pose, then re-apply the
    /// collision clamp.
    pub fn apply_snap(&mut self, target: Pose, pos_blend: f64, theta_blend: f64) -> PoseUpdate {
        let pos_blend = pos_blend.clamp(0.0, 1.0);
        let theta_blend = theta_blend.clamp(0.0, 1.0);

        let from = self.pose.position();
        let blended = Point::new(
            from.x + (target.x_mm - from.x) * pos_blend,
            from.y + (target.y_mm - from.y) * pos_blend,
        );
        let accepted = self.clamp_position(from, blended);

        let theta = normalize_deg(
            self.pose.theta_deg
                + shortest_arc_deg(self.pose.theta_deg, target.theta_deg) * theta_blend,
        );
        let dtheta = shortest_arc_deg(self.pose.theta_deg, theta);
        let moved = from.distance(accepted);

        self.pose = Pose::new(accepted.x, accepted.y, theta);
        self.last_distance_mm = moved;
        self.last_angle_deg = dtheta;

        if moved > 1e-9 || dtheta.abs() > 1e-9 {
            self.write_history(HistoryRecord::update(self.pose, "snap", moved, dtheta));
        }
        self.current()
    }

    fn consume_encoder_deltas(&mut self, snapshot: &SensorSnapshot) -> (i16, i16) {
        let left = snapshot.left_encoder_counts;
        let right = snapshot.right_encoder_counts;
        let (Some(last_left), Some(last_right)) =
            (self.last_left_counts, self.last_right_counts)
        else {
            self.last_left_counts = Some(left);
            self.last_right_counts = Some(right);
            return (0, 0);
        };
        // Counts roll over at 2^16; wrapping subtraction keeps a crossing
        // delta small and signed.
        let dl = left.wrapping_sub(last_left) as i16;
        let dr = right.wrapping_sub(last_right) as i16;
        self.last_left_counts = Some(left);
        self.last_right_counts = Some(right);
        (dl, dr)
    }

    fn write_history(&self, record: HistoryRecord) {
        if let Some(history) = &self.history {
            // History persistence must never break live control.
            if let Err(e) = history.append(&record) {
                log::warn!("History append failed: {}", e);
            }
        }
    }
}

/// Shared estimator handle: one writer thread, many readers.
pub type SharedOdometry = Arc<RwLock<OdometryEstimator>>;

/// Spawn the odometry writer thread.
///
/// Consumes the driver's no-drop frame channel and applies every frame in
/// arrival order. Exits when the channel closes or shutdown is signalled.
pub fn spawn_writer(
    odometry: SharedOdometry,
    frames: crossbeam_channel::Receiver<SensorSnapshot>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("odometry-writer".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match frames.recv_timeout(std::time::Duration::from_millis(200)) {
                    Ok(snapshot) => {
                        let Ok(mut estimator) = odometry.write() else {
                            log::error!("Odometry writer: lock poisoned, exiting");
                            break;
                        };
                        estimator.update_from_snapshot(&snapshot);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!("Odometry writer exiting");
        })
}
