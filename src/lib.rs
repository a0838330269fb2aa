//! sarathi - teleoperation and live-monitoring daemon for Roomba-class
//! robots speaking the serial Open Interface.
//!
//! A human operator drives the robot through a control channel; the daemon
//! mediates every command, enforces bumper/cliff safety, streams sensor
//! telemetry, estimates the pose from wheel encoders under map-aware
//! collision constraints, and optionally corrects that pose from fiducial
//! marker detections.

pub mod camera;
pub mod config;
pub mod control;
pub mod error;
pub mod fiducial;
pub mod geometry;
pub mod odometry;
pub mod oi;
pub mod plan;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use geometry::Pose;
