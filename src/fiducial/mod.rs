//! Fiducial detection worker and pose-snap application.
//!
//! The worker consumes the latest camera frame at a configured cadence, runs
//! the dictionary detector, and publishes a latest-wins [`FiducialResult`].
//! The snap applier turns fresh results into odometry corrections through
//! [`snap::compute_target`] and `apply_snap`.
//!
//! # Worker States
//!
//! `disabled` → `waiting_frame` on enable; `waiting_frame` → `detecting`
//! when a frame is available; `detecting` → `published` or
//! `failed(reason)`; both return to `waiting_frame` for the next period.

pub mod detect;
pub mod snap;

use crate::camera::FrameSlot;
use crate::config::Config;
use crate::error::Error;
use crate::odometry::SharedOdometry;
use crate::plan::PlanManager;
use detect::{Dictionary, GridDetector, MarkerDetector, MarkerObservation};
use serde::Serialize;
use snap::SnapTuning;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Latest detector output, published to telemetry and the snap applier.
#[derive(Debug, Clone, Serialize)]
pub struct FiducialResult {
    pub ok: bool,
    pub enabled: bool,
    /// "detected", or the failure reason ("idle", "no_frame",
    /// "decode_failed", "unsupported_dictionary:<name>",
    /// "detector_error:<msg>").
    pub reason: String,
    pub markers: Vec<MarkerObservation>,
    pub count: usize,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Detection time, microseconds since the Unix epoch.
    pub timestamp_us: Option<u64>,
    #[serde(skip)]
    pub produced_at: Option<Instant>,
}

impl FiducialResult {
    fn initial(enabled: bool) -> Self {
        Self {
            ok: false,
            enabled,
            reason: if enabled { "idle" } else { "disabled" }.to_string(),
            markers: Vec::new(),
            count: 0,
            frame_width: 0,
            frame_height: 0,
            timestamp_us: None,
            produced_at: None,
        }
    }

    fn failure(reason: String) -> Self {
        Self {
            ok: false,
            enabled: true,
            reason,
            markers: Vec::new(),
            count: 0,
            frame_width: 0,
            frame_height: 0,
            timestamp_us: None,
            produced_at: Some(Instant::now()),
        }
    }

    fn detected(markers: Vec<MarkerObservation>, width: u32, height: u32) -> Self {
        let now_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            ok: true,
            enabled: true,
            reason: "detected".to_string(),
            count: markers.len(),
            markers,
            frame_width: width,
            frame_height: height,
            timestamp_us: Some(now_us),
            produced_at: Some(Instant::now()),
        }
    }

    /// Age of this result, if it was ever produced.
    pub fn age(&self) -> Option<Duration> {
        self.produced_at.map(|at| at.elapsed())
    }
}

/// Latest-wins slot for the newest detection result.
#[derive(Clone)]
pub struct FiducialSlot {
    inner: Arc<Mutex<FiducialResult>>,
    fresh: crossbeam_channel::Sender<()>,
    fresh_rx: crossbeam_channel::Receiver<()>,
}

impl FiducialSlot {
    pub fn new(enabled: bool) -> Self {
        let (fresh, fresh_rx) = crossbeam_channel::bounded(1);
        Self {
            inner: Arc::new(Mutex::new(FiducialResult::initial(enabled))),
            fresh,
            fresh_rx,
        }
    }

    fn publish(&self, result: FiducialResult) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = result;
        }
        // Latest-wins wakeup: a pending token already covers this result.
        let _ = self.fresh.try_send(());
    }

    pub fn latest(&self) -> FiducialResult {
        self.inner
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn wakeups(&self) -> crossbeam_channel::Receiver<()> {
        self.fresh_rx.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum WorkerState {
    WaitingFrame,
    Detecting,
    Published,
    Failed(String),
}

/// Background detection worker.
pub struct FiducialWorker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FiducialWorker {
    /// Spawn the worker. With an unsupported dictionary name the worker
    /// still runs and publishes the failure every period.
    pub fn spawn(
        config: &Config,
        frames: FrameSlot,
        slot: FiducialSlot,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let period = config.aruco_interval();
        let dictionary_name = config.aruco_dictionary.clone();

        let handle = thread::Builder::new()
            .name("fiducial-worker".to_string())
            .spawn(move || {
                let detector = Dictionary::parse(&dictionary_name)
                    .map(|d| Box::new(GridDetector::new(d)) as Box<dyn MarkerDetector>);
                worker_loop(
                    thread_shutdown,
                    period,
                    detector,
                    dictionary_name,
                    frames,
                    slot,
                );
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for FiducialWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    shutdown: Arc<AtomicBool>,
    period: Duration,
    detector: Option<Box<dyn MarkerDetector>>,
    dictionary_name: String,
    frames: FrameSlot,
    slot: FiducialSlot,
) {
    let mut state = WorkerState::WaitingFrame;
    log::info!(
        "Fiducial worker started ({}, every {} ms)",
        dictionary_name,
        period.as_millis()
    );

    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();

        let next = match &detector {
            None => {
                FiducialResult::failure(format!("unsupported_dictionary:{}", dictionary_name))
            }
            Some(detector) => detect_once(detector.as_ref(), &frames, period, &mut state),
        };
        state = if next.ok {
            WorkerState::Published
        } else {
            WorkerState::Failed(next.reason.clone())
        };
        log::trace!("Fiducial worker: {:?}", state);
        slot.publish(next);

        // Both terminal states return to waiting after the period.
        let elapsed = started.elapsed();
        if elapsed < period {
            thread::sleep(period - elapsed);
        }
        state = WorkerState::WaitingFrame;
        log::trace!("Fiducial worker: {:?}", state);
    }
    log::info!("Fiducial worker exiting");
}

fn detect_once(
    detector: &dyn MarkerDetector,
    frames: &FrameSlot,
    period: Duration,
    state: &mut WorkerState,
) -> FiducialResult {
    let Some((jpeg, age)) = frames.latest() else {
        return FiducialResult::failure("no_frame".to_string());
    };
    // The external pipeline stalled; the buffered frame is history.
    if age > period * 3 {
        return FiducialResult::failure("no_frame".to_string());
    }

    *state = WorkerState::Detecting;
    let image = match image::load_from_memory(&jpeg) {
        Ok(image) => image.to_luma8(),
        Err(e) => {
            log::debug!("Frame decode failed: {}", e);
            return FiducialResult::failure("decode_failed".to_string());
        }
    };
    let (width, height) = image.dimensions();

    match detector.detect(&image) {
        Ok(markers) => FiducialResult::detected(markers, width, height),
        Err(e) => FiducialResult::failure(format!("detector_error:{}", e)),
    }
}

/// Spawn the snap applier: blends fresh detection results into odometry.
pub fn spawn_snap_applier(
    config: &Config,
    slot: FiducialSlot,
    plans: Arc<PlanManager>,
    odometry: SharedOdometry,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let tuning = SnapTuning {
        focal_px: config.aruco_focal_px,
        heading_gain_deg: config.aruco_heading_gain_deg,
    };
    let pos_blend = config.aruco_pose_blend;
    let theta_blend = config.aruco_theta_blend;
    let stale_after = config.aruco_interval() * 2;
    let wakeups = slot.wakeups();

    thread::Builder::new()
        .name("fiducial-snap".to_string())
        .spawn(move || {
            // Each distinct rejection is logged once, not per frame.
            let mut logged: HashSet<String> = HashSet::new();
            while !shutdown.load(Ordering::Relaxed) {
                match wakeups.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }

                let result = slot.latest();
                if !result.ok {
                    continue;
                }
                if let Err(e) = apply_result(
                    &result,
                    stale_after,
                    &plans,
                    &odometry,
                    &tuning,
                    pos_blend,
                    theta_blend,
                ) {
                    let signature = e.to_string();
                    if logged.insert(signature.clone()) {
                        log::info!("{}", signature);
                    }
                }
            }
            log::info!("Snap applier exiting");
        })
}

fn apply_result(
    result: &FiducialResult,
    stale_after: Duration,
    plans: &PlanManager,
    odometry: &SharedOdometry,
    tuning: &SnapTuning,
    pos_blend: f64,
    theta_blend: f64,
) -> crate::error::Result<()> {
    if result.age().map(|age| age > stale_after).unwrap_or(true) {
        return Err(Error::SnapRejected("stale detection result".into()));
    }
    let plan = plans
        .get()
        .ok_or_else(|| Error::SnapRejected("no plan loaded".into()))?;
    let target = snap::compute_target(&plan, &result.markers, result.frame_width, tuning)?;

    let mut estimator = odometry.write().map_err(|_| Error::MutexPoisoned)?;
    let update = estimator.apply_snap(target, pos_blend, theta_blend);
    log::debug!(
        "Snap applied: target=({:.0}, {:.0}, {:.1}) pose=({:.0}, {:.0}, {:.1})",
        target.x_mm,
        target.y_mm,
        target.theta_deg,
        update.pose.x_mm,
        update.pose.y_mm,
        update.pose.theta_deg
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_publish_and_wakeup() {
        let slot = FiducialSlot::new(true);
        assert_eq!(slot.latest().reason, "idle");

        slot.publish(FiducialResult::detected(Vec::new(), 640, 480));
        slot.publish(FiducialResult::failure("no_frame".into()));
        let latest = slot.latest();
        assert_eq!(latest.reason, "no_frame");
        // Two publishes, one pending wakeup token.
        let rx = slot.wakeups();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_initial_result() {
        let slot = FiducialSlot::new(false);
        let result = slot.latest();
        assert!(!result.ok);
        assert_eq!(result.reason, "disabled");
    }
}
