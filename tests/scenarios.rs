//! End-to-end scenarios across driver, odometry, control and fiducial snap.

use sarathi::config::Config;
use sarathi::control::handle_control_message;
use sarathi::error::Result;
use sarathi::fiducial::detect::{render_marker, Dictionary, GridDetector, MarkerDetector};
use sarathi::fiducial::snap::{compute_target, SnapTuning};
use sarathi::geometry::Pose;
use sarathi::odometry::history::{HistoryRecord, JsonlHistoryStore};
use sarathi::odometry::OdometryEstimator;
use sarathi::oi::{commands, RoombaDriver, SensorSnapshot};
use sarathi::plan::{Plan, PlanDocument};
use sarathi::transport::{BenchLink, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn bench_driver(write_timeout: Duration) -> (Arc<RoombaDriver>, BenchLink) {
    let bench = BenchLink::new();
    let factory_bench = bench.clone();
    let factory = Arc::new(move || -> Result<Box<dyn Transport>> {
        Ok(Box::new(factory_bench.clone()) as Box<dyn Transport>)
    });
    (Arc::new(RoombaDriver::new(factory, write_timeout)), bench)
}

fn square_room_plan() -> Plan {
    let doc: PlanDocument = serde_json::from_str(
        r#"{
            "contour": [[0, 0], [3000, 0], [3000, 3000], [0, 3000]],
            "start_pose": {"x_mm": 500, "y_mm": 500, "theta_deg": 0}
        }"#,
    )
    .unwrap();
    Plan::from_document(&doc, 150.0).unwrap()
}

fn encoder_snapshot(left: u16, right: u16) -> SensorSnapshot {
    SensorSnapshot {
        left_encoder_counts: left,
        right_encoder_counts: right,
        ..Default::default()
    }
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn straight_line_in_empty_room() {
    let plan = square_room_plan();
    let config = Config::default();
    let mut odom = OdometryEstimator::new(&config);
    odom.set_collision_map(Some(plan.collision_map(99.0)));
    odom.reset_to(plan.start_pose());

    odom.update_from_snapshot(&encoder_snapshot(0, 0));
    for i in 1..=10u16 {
        odom.update_from_snapshot(&encoder_snapshot(i * 100, i * 100));
    }

    let pose = odom.current().pose;
    assert!((pose.x_mm - 945.0).abs() < 1.0);
    assert!((pose.y_mm - 500.0).abs() < 1.0);
    assert!(pose.theta_deg.abs() < 1e-9);
}

#[test]
fn forward_motion_clamps_at_wall_clearance() {
    let plan = square_room_plan();
    let config = Config::default();
    let clearance = 180.0 * 0.55;
    let mut odom = OdometryEstimator::new(&config);
    odom.set_collision_map(Some(plan.collision_map(clearance)));
    odom.reset_to(Pose::new(2700.0, 500.0, 0.0));

    odom.update_from_snapshot(&encoder_snapshot(0, 0));
    for i in 1..=10u16 {
        odom.update_from_snapshot(&encoder_snapshot(i * 100, i * 100));
    }

    let pose = odom.current().pose;
    // 445mm requested; the margin line sits at x = 3000 - 99.
    assert!(pose.x_mm > 2700.0);
    assert!(pose.x_mm <= 3000.0 - clearance + 1e-6);
    assert_eq!(pose.theta_deg, 0.0);

    // Still pinned after more forward ticks.
    let pinned = odom.current().pose.x_mm;
    odom.update_from_snapshot(&encoder_snapshot(1100, 1100));
    assert_eq!(odom.current().pose.x_mm, pinned);
}

#[test]
fn bumper_guard_rewrites_forward_but_allows_right_turn() {
    let (driver, bench) = bench_driver(Duration::from_secs(1));
    let config = Config::default();

    // Bring the stream up and report a pressed left bumper.
    driver.ensure_sensor_stream(1, 50.0).unwrap();
    bench.push_frame(&[7, 0x02]);
    assert!(wait_until(Duration::from_secs(2), || {
        driver.latest_snapshot().bump_left
    }));
    // Quiesce the reader so its link supervision cannot interleave writes
    // with the command bytes below. The bumper state stays latched.
    driver.stop_sensor_stream().unwrap();
    bench.take_sent();

    // Forward drive is rewritten to stop.
    let reply = handle_control_message(
        r#"{"action":"drive","velocity":200,"radius":32768}"#,
        &driver,
        &config,
    )
    .unwrap();
    assert_eq!(reply["action"], "stop");
    assert_eq!(reply["guard"], "left_bumper");
    assert_eq!(reply["rewritten"], true);
    let written = bench.sent();
    assert_eq!(&written[..5], commands::DriveParams::stop().encode().as_slice());
    bench.take_sent();

    // A right turn is allowed through unchanged.
    let reply = handle_control_message(
        r#"{"action":"drive","velocity":200,"radius":-200}"#,
        &driver,
        &config,
    )
    .unwrap();
    assert_eq!(reply["action"], "drive");
    assert_eq!(reply["velocity"], 200);
    assert_eq!(reply["radius"], -200);
    assert!(reply.get("guard").is_none());
    let written = bench.sent();
    let expected = commands::DriveParams::clamped(200, -200).encode();
    assert_eq!(&written[..5], expected.as_slice());

    driver.close();
}

#[test]
fn sensor_stream_recovers_from_silence() {
    let (driver, bench) = bench_driver(Duration::from_secs(1));

    // 50 Hz stream: the 5-period stall budget is 100 ms.
    driver.ensure_sensor_stream(1, 50.0).unwrap();
    bench.push_frame(&[7, 0x00]);
    assert!(wait_until(Duration::from_secs(2), || {
        driver.health().last_update_age().is_some()
    }));
    let restarts_before = driver.health().restart_count();
    bench.take_sent();

    // Silence: no more bytes arrive.
    assert!(wait_until(Duration::from_secs(3), || {
        driver.health().restart_count() > restarts_before
    }));
    let error = driver.health().last_error().unwrap();
    assert!(error.contains("no sensor frame"));

    // The supervisor re-issued start + safe + stream.
    assert!(wait_until(Duration::from_secs(1), || {
        let written = bench.sent();
        written.windows(2).any(|w| w == [128, 131]) && bench.saw_stream_request(1)
    }));

    // Frames resume, split across reads as a UART would deliver them; the
    // link comes back alive.
    bench.limit_burst(3);
    bench.push_frame(&[7, 0x00]);
    bench.push_frame(&[8, 0x01]);
    assert!(wait_until(Duration::from_secs(2), || driver.health().alive()));

    driver.close();
}

#[test]
fn history_restore_beats_plan_start_pose() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("odometry_history.jsonl");

    {
        let store = JsonlHistoryStore::open(&path).unwrap();
        store
            .append(&HistoryRecord::update(
                Pose::new(1234.0, 567.0, 45.0),
                "encoders",
                10.0,
                0.0,
            ))
            .unwrap();
    }

    // Startup sequence: restored history pose wins over the plan's.
    let store = Arc::new(JsonlHistoryStore::open(&path).unwrap());
    let plan = square_room_plan();
    let config = Config::default();
    let mut odom = OdometryEstimator::new(&config);
    let start = store.last_pose().unwrap_or_else(|| plan.start_pose());
    odom.set_history(store);
    odom.reset_to(start);

    assert_eq!(odom.current().pose, Pose::new(1234.0, 567.0, 45.0));
}

#[test]
fn fiducial_snap_blends_toward_declared_pose() {
    let doc: PlanDocument = serde_json::from_str(
        r#"{
            "contour": [[0, 0], [3000, 0], [3000, 3000], [0, 3000]],
            "aruco_markers": [
                {"id": 7, "x_mm": 2000, "y_mm": 2000, "theta_deg": 180,
                 "size_mm": 150, "snap_pose": {"x_mm": 1700, "y_mm": 2000}}
            ]
        }"#,
    )
    .unwrap();
    let plan = Plan::from_document(&doc, 150.0).unwrap();

    let observation = sarathi::fiducial::detect::MarkerObservation {
        id: 7,
        corners: [
            [291.5, 211.5],
            [348.5, 211.5],
            [348.5, 268.5],
            [291.5, 268.5],
        ],
        center: [320.0, 240.0],
        area_px: 3253.0,
    };
    let tuning = SnapTuning {
        focal_px: 615.0,
        heading_gain_deg: 30.0,
    };
    let target = compute_target(&plan, &[observation], 640, &tuning).unwrap();
    assert!((target.x_mm - 1700.0).abs() < 1e-6);
    assert!((target.y_mm - 2000.0).abs() < 1e-6);
    assert!(target.theta_deg.abs() < 1.0);

    let config = Config::default();
    let mut odom = OdometryEstimator::new(&config);
    odom.reset_to(Pose::new(1500.0, 2000.0, 0.0));
    let update = odom.apply_snap(target, 0.35, 0.2);
    assert!((update.pose.x_mm - 1570.0).abs() < 1e-6);
    assert!((update.pose.y_mm - 2000.0).abs() < 1e-6);
    assert!(update.pose.theta_deg.abs() < 1.0);
}

#[test]
fn rendered_marker_drives_the_snap_pipeline() {
    // Detector output feeds the same solver the worker uses.
    let image = render_marker(7, Dictionary::Dict4x4_50, 20, 60);
    let detector = GridDetector::new(Dictionary::Dict4x4_50);
    let observations = detector.detect(&image).unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].id, 7);

    let doc: PlanDocument = serde_json::from_str(
        r#"{
            "contour": [[0, 0], [3000, 0], [3000, 3000], [0, 3000]],
            "aruco_markers": [{"id": 7, "x_mm": 2000, "y_mm": 2000, "theta_deg": 180}]
        }"#,
    )
    .unwrap();
    let plan = Plan::from_document(&doc, 150.0).unwrap();
    let tuning = SnapTuning {
        focal_px: 615.0,
        heading_gain_deg: 30.0,
    };
    let target = compute_target(&plan, &observations, image.width(), &tuning).unwrap();
    // Marker axis points -x; the target sits between the marker and origin,
    // facing +x.
    assert!(target.x_mm < 2000.0);
    assert!((target.y_mm - 2000.0).abs() < 60.0);
    assert!(target.theta_deg.abs() < 15.0);
}

#[test]
fn drive_commands_reach_the_wire_in_order() {
    let (driver, bench) = bench_driver(Duration::from_secs(1));
    let config = Config::default();

    for message in [
        r#"{"action":"drive","velocity":100,"radius":32768}"#,
        r#"{"action":"drive","velocity":150,"radius":32768}"#,
        r#"{"action":"stop"}"#,
    ] {
        handle_control_message(message, &driver, &config).unwrap();
    }

    let written = bench.sent();
    assert_eq!(written.len(), 15);
    let velocities: Vec<i16> = written
        .chunks(5)
        .map(|frame| i16::from_be_bytes([frame[1], frame[2]]))
        .collect();
    assert_eq!(velocities, vec![100, 150, 0]);

    driver.close();
}
