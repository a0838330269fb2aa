//! Telemetry broadcaster.
//!
//! Every tick the broadcaster assembles one JSON snapshot of robot, pose and
//! fiducial state and fans it out to all subscribers. Subscribers get a
//! bounded queue; one that stops draining is dropped rather than allowed to
//! stall the tick. Read locks are taken in a fixed order (odometry →
//! sensors → fiducial) so no other lock chain can deadlock against it.
//!
//! Snapshot fields are additive across versions: consumers must tolerate
//! unknown fields.

use crate::fiducial::{FiducialResult, FiducialSlot};
use crate::odometry::SharedOdometry;
use crate::oi::{RoombaDriver, SensorSnapshot, StreamHealthReport};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Queue depth per subscriber before it is considered stuck.
const SUBSCRIBER_QUEUE: usize = 8;

/// Pose section of a telemetry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OdometryReport {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    pub last_delta_distance_mm: f64,
    pub last_delta_angle_deg: f64,
}

/// Fiducial section of a telemetry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FiducialReport {
    #[serde(flatten)]
    pub result: FiducialResult,
    /// True when the latest result is older than two detection periods.
    pub stale: bool,
}

/// One broadcast tick.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Assembly time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    #[serde(flatten)]
    pub stream: StreamHealthReport,
    pub sensors: SensorSnapshot,
    pub odometry: OdometryReport,
    pub fiducial: FiducialReport,
}

/// Subscriber registry shared between the broadcaster and the listener.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    senders: Arc<Mutex<Vec<Sender<String>>>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and get its queue.
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE);
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    /// Deliver one serialized snapshot, dropping stuck subscribers.
    fn publish(&self, line: &str) {
        let Ok(mut senders) = self.senders.lock() else {
            return;
        };
        senders.retain(|tx| match tx.try_send(line.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Dropping slow telemetry subscriber");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Assemble one snapshot. Lock order: odometry → sensors → fiducial.
pub fn assemble_snapshot(
    driver: &RoombaDriver,
    odometry: &SharedOdometry,
    fiducial: &FiducialSlot,
    fiducial_period: Duration,
) -> TelemetrySnapshot {
    let pose_update = odometry
        .read()
        .map(|estimator| estimator.current())
        .unwrap_or_else(|e| e.into_inner().current());

    let sensors = driver.latest_snapshot();
    let stream = driver.health().report();

    let result = fiducial.latest();
    let stale = result
        .age()
        .map(|age| age > fiducial_period * 2)
        .unwrap_or(true);

    TelemetrySnapshot {
        timestamp_us: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0),
        stream,
        sensors,
        odometry: OdometryReport {
            x_mm: pose_update.pose.x_mm,
            y_mm: pose_update.pose.y_mm,
            theta_deg: pose_update.pose.theta_deg,
            last_delta_distance_mm: pose_update.distance_mm,
            last_delta_angle_deg: pose_update.angle_deg,
        },
        fiducial: FiducialReport { result, stale },
    }
}

/// Spawn the periodic broadcaster.
#[allow(clippy::too_many_arguments)]
pub fn spawn_broadcaster(
    interval: Duration,
    fiducial_period: Duration,
    driver: Arc<RoombaDriver>,
    odometry: SharedOdometry,
    fiducial: FiducialSlot,
    subscribers: SubscriberSet,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("telemetry-broadcaster".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let started = std::time::Instant::now();
                if !subscribers.is_empty() {
                    let snapshot =
                        assemble_snapshot(&driver, &odometry, &fiducial, fiducial_period);
                    match serde_json::to_string(&snapshot) {
                        Ok(line) => subscribers.publish(&line),
                        Err(e) => log::error!("Telemetry serialize failed: {}", e),
                    }
                }
                let elapsed = started.elapsed();
                if elapsed < interval {
                    thread::sleep(interval - elapsed);
                }
            }
            log::info!("Telemetry broadcaster exiting");
        })
}

/// Accept loop for telemetry subscribers: each connection gets a writer
/// thread draining its queue.
pub fn spawn_telemetry_server(
    bind_address: String,
    subscribers: SubscriberSet,
    shutdown: Arc<AtomicBool>,
) -> crate::error::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(&bind_address).map_err(|e| {
        crate::error::Error::Other(format!(
            "Failed to bind telemetry listener {}: {}",
            bind_address, e
        ))
    })?;
    listener.set_nonblocking(true)?;
    log::info!("Telemetry listener on {}", bind_address);

    let handle = thread::Builder::new()
        .name("telemetry-listener".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        log::info!("Telemetry subscriber connected: {}", addr);
                        let queue = subscribers.subscribe();
                        let spawned = thread::Builder::new()
                            .name("telemetry-writer".to_string())
                            .spawn(move || writer_loop(stream, queue));
                        if let Err(e) = spawned {
                            log::error!("Failed to spawn telemetry writer: {}", e);
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => log::error!("Telemetry accept error: {}", e),
                }
            }
            log::info!("Telemetry listener exiting");
        })
        .map_err(|e| crate::error::Error::Other(format!("spawn failed: {}", e)))?;
    Ok(handle)
}

fn writer_loop(mut stream: TcpStream, queue: Receiver<String>) {
    loop {
        match queue.recv_timeout(Duration::from_millis(500)) {
            Ok(line) => {
                if writeln!(stream, "{}", line).is_err() {
                    break; // subscriber went away
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Telemetry writer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::odometry::OdometryEstimator;
    use crate::transport::{BenchLink, Transport};
    use std::sync::RwLock;

    fn bench_driver() -> Arc<RoombaDriver> {
        let bench = BenchLink::new();
        let factory = Arc::new(move || -> crate::error::Result<Box<dyn Transport>> {
            Ok(Box::new(bench.clone()) as Box<dyn Transport>)
        });
        Arc::new(RoombaDriver::new(factory, Duration::from_secs(1)))
    }

    #[test]
    fn test_snapshot_carries_all_sections() {
        let driver = bench_driver();
        let config = Config::default();
        let odometry: SharedOdometry =
            Arc::new(RwLock::new(OdometryEstimator::new(&config)));
        let fiducial = FiducialSlot::new(false);

        let snapshot =
            assemble_snapshot(&driver, &odometry, &fiducial, Duration::from_millis(500));
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();

        assert!(value["sensor_stream_alive"].is_boolean());
        assert!(value["sensors"]["battery_pct"].is_number());
        assert!(value["odometry"]["x_mm"].is_number());
        assert_eq!(value["fiducial"]["reason"], "disabled");
        assert_eq!(value["fiducial"]["stale"], serde_json::json!(true));
    }

    #[test]
    fn test_slow_subscriber_dropped() {
        let subscribers = SubscriberSet::new();
        let _queue = subscribers.subscribe();
        assert_eq!(subscribers.len(), 1);

        // Fill the queue past its bound without draining.
        for i in 0..SUBSCRIBER_QUEUE + 1 {
            subscribers.publish(&format!("snapshot {}", i));
        }
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_disconnected_subscriber_dropped() {
        let subscribers = SubscriberSet::new();
        drop(subscribers.subscribe());
        subscribers.publish("snapshot");
        assert_eq!(subscribers.len(), 0);
    }
}
