//! sarathi - teleoperation daemon entrypoint.
//!
//! Exit codes: 0 normal shutdown, 1 fatal initialization failure, 2 invalid
//! plan, 3 serial port unavailable when `roomba_connect_on_start` is set.

use sarathi::camera::{FrameFilePoller, FrameSlot};
use sarathi::config::Config;
use sarathi::control::spawn_control_server;
use sarathi::error::Error;
use sarathi::fiducial::{spawn_snap_applier, FiducialSlot, FiducialWorker};
use sarathi::odometry::{history::JsonlHistoryStore, spawn_writer, OdometryEstimator};
use sarathi::oi::RoombaDriver;
use sarathi::plan::PlanManager;
use sarathi::telemetry::{spawn_broadcaster, spawn_telemetry_server, SubscriberSet};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const EXIT_FATAL: i32 = 1;
const EXIT_PLAN_INVALID: i32 = 2;
const EXIT_PORT_UNAVAILABLE: i32 = 3;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::process::exit(run());
}

fn run() -> i32 {
    log::info!("sarathi v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match env::args().nth(1) {
        Some(path) => {
            log::info!("Using config: {}", path);
            match Config::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("{}", e);
                    return EXIT_FATAL;
                }
            }
        }
        None => {
            log::info!("Using default configuration");
            Config::default()
        }
    };
    let config = Arc::new(config);

    // Pose history
    let history = match JsonlHistoryStore::open(&config.odometry_history_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("Cannot open history file: {}", e);
            return EXIT_FATAL;
        }
    };

    // Plan
    let plans = Arc::new(PlanManager::new());
    if let Some(path) = &config.plan_default_path {
        match plans.load_from_file(path, config.aruco_marker_size_mm()) {
            Ok(plan) => log::info!(
                "Plan loaded: {} obstacles, {} markers",
                plan.obstacles().len(),
                plan.markers().len()
            ),
            Err(e) => {
                log::error!("{}", e);
                return EXIT_PLAN_INVALID;
            }
        }
    }

    // Driver
    let driver = Arc::new(RoombaDriver::from_config(&config));
    if config.roomba_connect_on_start {
        if let Err(e) = driver.connect() {
            log::error!("{}", e);
            return match e {
                Error::PortUnavailable(_) | Error::Serial(_) => EXIT_PORT_UNAVAILABLE,
                _ => EXIT_FATAL,
            };
        }
    }

    // Odometry: restored pose beats the plan start pose.
    let mut estimator = OdometryEstimator::new(&config);
    estimator.set_history(Arc::clone(&history));
    if let Some(plan) = plans.get() {
        let clearance = config.odometry_robot_radius_mm * config.odometry_collision_margin_scale;
        estimator.set_collision_map(Some(plan.collision_map(clearance)));
    }
    let start_pose = history
        .last_pose()
        .or_else(|| plans.get().map(|p| p.start_pose()))
        .unwrap_or_default();
    log::info!(
        "Start pose: ({:.0}, {:.0}, {:.1}°)",
        start_pose.x_mm,
        start_pose.y_mm,
        start_pose.theta_deg
    );
    estimator.reset_to(start_pose);
    let odometry = Arc::new(RwLock::new(estimator));

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received shutdown signal");
            flag.store(true, Ordering::Relaxed);
        }) {
            log::error!("Error setting Ctrl-C handler: {}", e);
            return EXIT_FATAL;
        }
    }

    // Odometry writer consuming the no-drop frame channel
    let frames = driver.subscribe_frames();
    let odometry_writer = match spawn_writer(Arc::clone(&odometry), frames, Arc::clone(&shutdown))
    {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Failed to spawn odometry writer: {}", e);
            return EXIT_FATAL;
        }
    };

    // Camera frame slot fed by the external pipeline's latest-frame file
    let frame_slot = FrameSlot::new();
    let _frame_poller = config.camera_frame_path.as_ref().and_then(|path| {
        match FrameFilePoller::spawn(
            PathBuf::from(path),
            frame_slot.clone(),
            Duration::from_millis(100),
        ) {
            Ok(poller) => Some(poller),
            Err(e) => {
                log::warn!("Camera frame poller not started: {}", e);
                None
            }
        }
    });

    // Fiducial worker + snap applier
    let fiducial_slot = FiducialSlot::new(config.aruco_enabled);
    let _fiducial_worker = if config.aruco_enabled {
        match FiducialWorker::spawn(&config, frame_slot.clone(), fiducial_slot.clone()) {
            Ok(worker) => Some(worker),
            Err(e) => {
                log::error!("Failed to spawn fiducial worker: {}", e);
                return EXIT_FATAL;
            }
        }
    } else {
        None
    };
    let _snap_applier = if config.aruco_enabled && config.aruco_snap_enabled {
        match spawn_snap_applier(
            &config,
            fiducial_slot.clone(),
            Arc::clone(&plans),
            Arc::clone(&odometry),
            Arc::clone(&shutdown),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to spawn snap applier: {}", e);
                return EXIT_FATAL;
            }
        }
    } else {
        None
    };

    // Telemetry fan-out
    let subscribers = SubscriberSet::new();
    let broadcaster = match spawn_broadcaster(
        Duration::from_secs_f64(config.telemetry_interval_sec),
        config.aruco_interval(),
        Arc::clone(&driver),
        Arc::clone(&odometry),
        fiducial_slot.clone(),
        subscribers.clone(),
        Arc::clone(&shutdown),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Failed to spawn broadcaster: {}", e);
            return EXIT_FATAL;
        }
    };
    let telemetry_server = match spawn_telemetry_server(
        config.telemetry_bind_address.clone(),
        subscribers,
        Arc::clone(&shutdown),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("{}", e);
            return EXIT_FATAL;
        }
    };

    // Operator control sessions
    let control_server = match spawn_control_server(
        Arc::clone(&config),
        Arc::clone(&driver),
        Arc::clone(&shutdown),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("{}", e);
            return EXIT_FATAL;
        }
    };

    log::info!("sarathi running. Press Ctrl-C to stop.");
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    // Orderly shutdown: wheels stopped and port released first, then the
    // workers drain.
    log::info!("Shutting down...");
    driver.close();
    let _ = odometry_writer.join();
    let _ = broadcaster.join();
    let _ = telemetry_server.join();
    let _ = control_server.join();
    log::info!("sarathi stopped");
    0
}
