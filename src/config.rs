//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! The configuration file is TOML-formatted. All tunables are a flat set of
//! named options so the same names can be supplied through any front-end:
//!
//! ```toml
//! roomba_serial_port = "/dev/ttyUSB0"
//! roomba_baudrate = 115200
//! roomba_timeout_sec = 1.0
//!
//! telemetry_interval_sec = 0.1
//!
//! odometry_source = "encoders"
//! odometry_mm_per_tick = 0.445
//! odometry_robot_radius_mm = 180.0
//! odometry_collision_margin_scale = 0.55
//! odometry_history_path = "data/odometry_history.jsonl"
//!
//! aruco_enabled = true
//! aruco_dictionary = "DICT_4X4_50"
//! aruco_interval_sec = 0.5
//! ```
//!
//! Every option has a default; an absent file yields the default config.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Odometry integration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OdometrySource {
    /// Wheel encoder counts (default; wrap-safe u16 deltas).
    Encoders,
    /// OI one-frame distance/angle fields.
    Distance,
}

/// Root configuration.
///
/// Option names follow the service's flat configuration registry so they can
/// be persisted and echoed verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // --- Driver ---
    /// Serial device of the robot's Open Interface port.
    #[serde(default = "default_serial_port")]
    pub roomba_serial_port: String,

    /// Serial baud rate (OI default 115200).
    #[serde(default = "default_baudrate")]
    pub roomba_baudrate: u32,

    /// Upper bound for any single command write, in seconds.
    #[serde(default = "default_timeout_sec")]
    pub roomba_timeout_sec: f64,

    /// Open the serial port during startup instead of on the first `init`.
    /// When set and the port cannot be opened the process exits with code 3.
    #[serde(default)]
    pub roomba_connect_on_start: bool,

    /// Sensor group id requested for the continuous stream.
    #[serde(default = "default_stream_group")]
    pub roomba_stream_group: u8,

    /// Expected stream rate used for health/timeout accounting.
    #[serde(default = "default_stream_hz")]
    pub roomba_stream_hz: f64,

    // --- Telemetry ---
    /// Broadcaster period in seconds.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_sec: f64,

    /// TCP bind address for telemetry subscribers.
    #[serde(default = "default_telemetry_bind")]
    pub telemetry_bind_address: String,

    /// TCP bind address for operator control sessions.
    #[serde(default = "default_control_bind")]
    pub control_bind_address: String,

    // --- Odometry ---
    #[serde(default = "default_odometry_source")]
    pub odometry_source: OdometrySource,

    /// Wheel travel per encoder tick (Roomba 7xx: 0.445 mm).
    #[serde(default = "default_mm_per_tick")]
    pub odometry_mm_per_tick: f64,

    /// Calibration gain applied to integrated translation.
    #[serde(default = "default_unit_scale")]
    pub odometry_linear_scale: f64,

    /// Calibration gain applied to integrated rotation.
    #[serde(default = "default_unit_scale")]
    pub odometry_angular_scale: f64,

    /// Collision disc radius in millimetres.
    #[serde(default = "default_robot_radius")]
    pub odometry_robot_radius_mm: f64,

    /// Fraction of the robot radius required as clearance from any edge.
    #[serde(default = "default_margin_scale")]
    pub odometry_collision_margin_scale: f64,

    /// Append-only JSON-lines pose history.
    #[serde(default = "default_history_path")]
    pub odometry_history_path: String,

    // --- Plan ---
    /// Plan document loaded at startup (optional).
    #[serde(default)]
    pub plan_default_path: Option<String>,

    // --- Camera / fiducial ---
    /// File written by the external camera process with the latest JPEG.
    #[serde(default)]
    pub camera_frame_path: Option<String>,

    #[serde(default)]
    pub aruco_enabled: bool,

    /// Detector cadence in seconds (clamped to >= 0.2).
    #[serde(default = "default_aruco_interval")]
    pub aruco_interval_sec: f64,

    #[serde(default = "default_aruco_dictionary")]
    pub aruco_dictionary: String,

    /// Apply snap corrections to odometry when detections reference the plan.
    #[serde(default)]
    pub aruco_snap_enabled: bool,

    /// Camera focal length in pixels, for the pinhole fallback estimators.
    #[serde(default = "default_focal_px")]
    pub aruco_focal_px: f64,

    /// Printed marker edge length in centimetres.
    #[serde(default = "default_marker_size_cm")]
    pub aruco_marker_size_cm: f64,

    /// Position blend factor toward the snap target, in [0, 1].
    #[serde(default = "default_pose_blend")]
    pub aruco_pose_blend: f64,

    /// Heading blend factor toward the snap target, in [0, 1].
    #[serde(default = "default_theta_blend")]
    pub aruco_theta_blend: f64,

    /// Gain of the image-offset heading correction, in degrees.
    #[serde(default = "default_heading_gain")]
    pub aruco_heading_gain_deg: f64,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baudrate() -> u32 {
    115_200
}
fn default_timeout_sec() -> f64 {
    1.0
}
fn default_stream_group() -> u8 {
    100
}
fn default_stream_hz() -> f64 {
    20.0
}
fn default_telemetry_interval() -> f64 {
    0.1
}
fn default_telemetry_bind() -> String {
    "0.0.0.0:7001".to_string()
}
fn default_control_bind() -> String {
    "0.0.0.0:7002".to_string()
}
fn default_odometry_source() -> OdometrySource {
    OdometrySource::Encoders
}
fn default_mm_per_tick() -> f64 {
    0.445
}
fn default_unit_scale() -> f64 {
    1.0
}
fn default_robot_radius() -> f64 {
    180.0
}
fn default_margin_scale() -> f64 {
    0.55
}
fn default_history_path() -> String {
    "data/odometry_history.jsonl".to_string()
}
fn default_aruco_interval() -> f64 {
    0.5
}
fn default_aruco_dictionary() -> String {
    "DICT_4X4_50".to_string()
}
fn default_focal_px() -> f64 {
    615.0
}
fn default_marker_size_cm() -> f64 {
    15.0
}
fn default_pose_blend() -> f64 {
    0.35
}
fn default_theta_blend() -> f64 {
    0.2
}
fn default_heading_gain() -> f64 {
    30.0
}

impl Default for Config {
    fn default() -> Self {
        // An empty document exercises every serde default.
        basic_toml::from_str("").expect("default config must parse")
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Validation
    ///
    /// - `roomba_timeout_sec`, `telemetry_interval_sec`, `roomba_stream_hz`
    ///   must be positive
    /// - `aruco_pose_blend` / `aruco_theta_blend` must lie in [0, 1]
    /// - `odometry_collision_margin_scale` must be non-negative
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.roomba_timeout_sec <= 0.0 {
            return Err(Error::Config("roomba_timeout_sec must be positive".into()));
        }
        if self.telemetry_interval_sec <= 0.0 {
            return Err(Error::Config(
                "telemetry_interval_sec must be positive".into(),
            ));
        }
        if self.roomba_stream_hz <= 0.0 {
            return Err(Error::Config("roomba_stream_hz must be positive".into()));
        }
        for (name, value) in [
            ("aruco_pose_blend", self.aruco_pose_blend),
            ("aruco_theta_blend", self.aruco_theta_blend),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must lie in [0, 1]", name)));
            }
        }
        if self.odometry_collision_margin_scale < 0.0 {
            return Err(Error::Config(
                "odometry_collision_margin_scale must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Detector cadence with the hardware floor applied.
    pub fn aruco_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.aruco_interval_sec.max(0.2))
    }

    /// Marker edge length in millimetres.
    pub fn aruco_marker_size_mm(&self) -> f64 {
        self.aruco_marker_size_cm * 10.0
    }
}
