//! Roomba Open Interface driver.
//!
//! Owns the serial port exclusively; every byte written to the robot goes
//! through [`RoombaDriver`]. A background reader thread decodes the
//! continuous sensor stream and self-heals the link when framing breaks or
//! frames stop arriving (see [`stream`]).
//!
//! # Thread Model
//!
//! 1. **Command path** (caller threads): encode + write under the port
//!    mutex, bounded by the configured write timeout.
//! 2. **Stream reader** (background): short port locks per read, frame
//!    reassembly, snapshot publication, link supervision.
//!
//! Critical sections stay small; the reader never holds the port mutex
//! while decoding or publishing.

pub mod commands;
pub mod frame;
pub mod snapshot;
mod stream;

pub use commands::{DriveParams, OiMode};
pub use snapshot::SensorSnapshot;
pub use stream::{StreamHealth, StreamHealthReport};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{SerialTransport, Transport, TransportFactory};
use commands::{
    encode_sensor_query, encode_stream_request, encode_stream_state, CMD_CLEAN, CMD_DOCK,
    CMD_POWER, CMD_START,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Serial link shared by the command path and the stream reader.
///
/// The port is optional so the supervisor can close and reopen it during
/// recovery; writes auto-connect on demand (first `init` after boot, or the
/// first command after a link loss).
pub(crate) struct LinkPort {
    factory: Arc<dyn TransportFactory>,
    port: Mutex<Option<Box<dyn Transport>>>,
    write_timeout: Duration,
}

impl LinkPort {
    fn new(factory: Arc<dyn TransportFactory>, write_timeout: Duration) -> Self {
        Self {
            factory,
            port: Mutex::new(None),
            write_timeout,
        }
    }

    /// Open the port if it is not already open. Idempotent.
    pub(crate) fn connect(&self) -> Result<()> {
        let mut guard = self.port.lock().map_err(|_| Error::MutexPoisoned)?;
        if guard.is_none() {
            *guard = Some(self.factory.open()?);
        }
        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        if let Ok(mut guard) = self.port.lock() {
            *guard = None;
        }
    }

    /// Write a full command, opening the port on demand.
    ///
    /// A failed write drops the port so the next attempt reopens it; a write
    /// exceeding the timeout reports [`Error::WriteTimeout`].
    pub(crate) fn write(&self, bytes: &[u8]) -> Result<()> {
        let started = Instant::now();
        let mut guard = self.port.lock().map_err(|_| Error::MutexPoisoned)?;
        if guard.is_none() {
            *guard = Some(self.factory.open()?);
        }
        let port = guard.as_mut().expect("port opened above");
        let outcome = port.write(bytes).and_then(|_| port.flush());
        match outcome {
            Ok(()) => {
                if started.elapsed() > self.write_timeout {
                    return Err(Error::WriteTimeout);
                }
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Read whatever is available into `buf` (0 on timeout / closed port).
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.port.lock().map_err(|_| Error::MutexPoisoned)?;
        match guard.as_mut() {
            Some(port) => match port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) => {
                    *guard = None;
                    Err(e)
                }
            },
            None => Ok(0),
        }
    }
}

struct StreamWorker {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    group: u8,
}

/// Open Interface driver: command encoding, drive coalescing, and the
/// supervised sensor stream.
pub struct RoombaDriver {
    link: Arc<LinkPort>,
    closed: Arc<AtomicBool>,
    last_drive: Mutex<Option<DriveParams>>,
    latest: Arc<Mutex<SensorSnapshot>>,
    health: Arc<StreamHealth>,
    frame_senders: Arc<Mutex<Vec<Sender<SensorSnapshot>>>>,
    worker: Mutex<Option<StreamWorker>>,
}

impl RoombaDriver {
    /// Build a driver over an arbitrary transport factory (tests use
    /// [`crate::transport::BenchLink`] here).
    pub fn new(factory: Arc<dyn TransportFactory>, write_timeout: Duration) -> Self {
        Self {
            link: Arc::new(LinkPort::new(factory, write_timeout)),
            closed: Arc::new(AtomicBool::new(false)),
            last_drive: Mutex::new(None),
            latest: Arc::new(Mutex::new(SensorSnapshot::default())),
            health: Arc::new(StreamHealth::new()),
            frame_senders: Arc::new(Mutex::new(Vec::new())),
            worker: Mutex::new(None),
        }
    }

    /// Build a driver for the configured serial device.
    pub fn from_config(config: &Config) -> Self {
        let path = config.roomba_serial_port.clone();
        let baud = config.roomba_baudrate;
        let timeout = Duration::from_secs_f64(config.roomba_timeout_sec);
        let read_timeout = Duration::from_millis(15);
        let factory = Arc::new(move || -> Result<Box<dyn Transport>> {
            Ok(Box::new(SerialTransport::open(&path, baud, read_timeout)?) as Box<dyn Transport>)
        });
        Self::new(factory, timeout)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.link.write(bytes);
        if let Err(ref e) = result {
            self.health.record_error(e.to_string());
        }
        result
    }

    /// Open the serial port. Idempotent.
    pub fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.link.connect()
    }

    /// Send the OI Start opcode (enters Passive mode).
    pub fn start(&self) -> Result<()> {
        self.write(&[CMD_START])
    }

    /// Select Safe or Full mode.
    pub fn mode(&self, mode: OiMode) -> Result<()> {
        self.write(&[mode.opcode()])
    }

    /// Drive with the given velocity and turn radius.
    ///
    /// Values are clamped per the OI limits; a request identical to the last
    /// one sent is coalesced to keep the wire quiet. Returns the parameters
    /// actually in effect.
    pub fn drive(&self, velocity_mm_s: i32, radius_mm: i32) -> Result<DriveParams> {
        let params = DriveParams::clamped(velocity_mm_s, radius_mm);
        let mut last = self.last_drive.lock().map_err(|_| Error::MutexPoisoned)?;
        if *last == Some(params) {
            return Ok(params);
        }
        self.write(&params.encode())?;
        *last = Some(params);
        Ok(params)
    }

    /// Stop the wheels (`drive(0, straight)`).
    pub fn stop(&self) -> Result<DriveParams> {
        self.drive(0, commands::RADIUS_STRAIGHT)
    }

    pub fn clean(&self) -> Result<()> {
        self.write(&[CMD_CLEAN])
    }

    pub fn dock(&self) -> Result<()> {
        self.write(&[CMD_DOCK])
    }

    pub fn power_off(&self) -> Result<()> {
        self.write(&[CMD_POWER])
    }

    /// One-shot sensor query (opcode 142) for a packet or group id.
    ///
    /// Intended for use before the continuous stream is started; the stream
    /// and a query must not share the receive buffer.
    pub fn request_sensor_group(&self, group_id: u8) -> Result<SensorSnapshot> {
        let size = snapshot::group_size(group_id)
            .or_else(|| snapshot::packet_size(group_id))
            .ok_or_else(|| {
                Error::DecoderInconsistent(format!("unknown sensor group {}", group_id))
            })?;
        self.write(&encode_sensor_query(group_id))?;

        let deadline = Instant::now() + self.link.write_timeout;
        let mut data = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            if Instant::now() > deadline {
                return Err(Error::WriteTimeout);
            }
            let n = self.link.read(&mut data[filled..])?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            filled += n;
        }

        let mut latest = self.latest.lock().map_err(|_| Error::MutexPoisoned)?;
        if snapshot::group_members(group_id).is_some() {
            latest.apply_group(group_id, &data)?;
        } else {
            latest.apply_packet(group_id, &data)?;
        }
        latest.touch();
        Ok(latest.clone())
    }

    /// Start (or restart) the continuous sensor stream. Idempotent: a worker
    /// already streaming the requested group only re-issues the stream
    /// request on the wire.
    pub fn ensure_sensor_stream(&self, group_id: u8, hz: f64) -> Result<()> {
        self.ensure_open()?;
        if snapshot::group_size(group_id)
            .or_else(|| snapshot::packet_size(group_id))
            .is_none()
        {
            return Err(Error::DecoderInconsistent(format!(
                "unknown sensor group {}",
                group_id
            )));
        }
        let period = Duration::from_secs_f64(1.0 / hz.max(1.0));
        self.health.set_period(period);

        let mut worker = self.worker.lock().map_err(|_| Error::MutexPoisoned)?;
        if let Some(existing) = worker.as_ref() {
            if existing.group == group_id && !existing.handle.is_finished() {
                self.write(&encode_stream_request(group_id))?;
                return Ok(());
            }
        }
        if let Some(old) = worker.take() {
            old.shutdown.store(true, Ordering::Relaxed);
            let _ = old.handle.join();
        }

        self.start()?;
        self.mode(OiMode::Safe)?;
        self.write(&encode_stream_request(group_id))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = stream::StreamContext {
            link: Arc::clone(&self.link),
            shutdown: Arc::clone(&shutdown),
            closed: Arc::clone(&self.closed),
            health: Arc::clone(&self.health),
            latest: Arc::clone(&self.latest),
            frame_senders: Arc::clone(&self.frame_senders),
            group_id,
            period,
        };
        let handle = std::thread::Builder::new()
            .name("oi-stream-reader".to_string())
            .spawn(move || stream::reader_loop(ctx))
            .map_err(|e| Error::Other(format!("Failed to spawn stream reader: {}", e)))?;

        *worker = Some(StreamWorker {
            shutdown,
            handle,
            group: group_id,
        });
        log::info!(
            "Sensor stream started (group {}, {:.0} Hz expected)",
            group_id,
            1.0 / period.as_secs_f64()
        );
        Ok(())
    }

    /// Pause the stream and stop the reader thread.
    pub fn stop_sensor_stream(&self) -> Result<()> {
        let mut worker = self.worker.lock().map_err(|_| Error::MutexPoisoned)?;
        if let Some(old) = worker.take() {
            old.shutdown.store(true, Ordering::Relaxed);
            let _ = self.link.write(&encode_stream_state(false));
            let _ = old.handle.join();
            log::info!("Sensor stream stopped");
        }
        Ok(())
    }

    /// Latest decoded snapshot with the live link flag filled in.
    pub fn latest_snapshot(&self) -> SensorSnapshot {
        let mut snap = self
            .latest
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        snap.link_alive = self.health.alive();
        snap
    }

    /// Subscribe to every decoded frame (unbounded; the stream supervisor
    /// restarts the link when a subscriber lags more than 200 ms).
    pub fn subscribe_frames(&self) -> Receiver<SensorSnapshot> {
        let (tx, rx) = unbounded();
        if let Ok(mut senders) = self.frame_senders.lock() {
            senders.push(tx);
        }
        rx
    }

    pub fn health(&self) -> Arc<StreamHealth> {
        Arc::clone(&self.health)
    }

    /// Terminal shutdown: stop the wheels, stop the stream, release the
    /// port. Every later call fails with [`Error::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.link.write(&DriveParams::stop().encode());
        let mut worker = match self.worker.lock() {
            Ok(w) => w,
            Err(e) => e.into_inner(),
        };
        if let Some(old) = worker.take() {
            old.shutdown.store(true, Ordering::Relaxed);
            let _ = self.link.write(&encode_stream_state(false));
            let _ = old.handle.join();
        }
        self.link.disconnect();
        log::info!("OI driver closed");
    }
}

impl Drop for RoombaDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BenchLink;

    fn bench_driver() -> (RoombaDriver, BenchLink) {
        let bench = BenchLink::new();
        let factory_bench = bench.clone();
        let factory = Arc::new(move || -> Result<Box<dyn Transport>> {
            Ok(Box::new(factory_bench.clone()) as Box<dyn Transport>)
        });
        (
            RoombaDriver::new(factory, Duration::from_secs(1)),
            bench,
        )
    }

    #[test]
    fn test_mode_commands_hit_the_wire() {
        let (driver, bench) = bench_driver();
        driver.start().unwrap();
        driver.mode(OiMode::Safe).unwrap();
        driver.mode(OiMode::Full).unwrap();
        assert_eq!(bench.sent(), vec![128, 131, 132]);
    }

    #[test]
    fn test_duplicate_drive_coalesced() {
        let (driver, bench) = bench_driver();
        driver.drive(200, 500).unwrap();
        driver.drive(200, 500).unwrap();
        assert_eq!(bench.sent().len(), 5); // one drive frame

        driver.drive(200, -500).unwrap();
        assert_eq!(bench.sent().len(), 10);
    }

    #[test]
    fn test_stop_after_stop_sends_one_message() {
        let (driver, bench) = bench_driver();
        driver.stop().unwrap();
        driver.stop().unwrap();
        assert_eq!(bench.sent(), DriveParams::stop().encode().to_vec());
    }

    #[test]
    fn test_one_shot_sensor_query_decodes_group() {
        let (driver, bench) = bench_driver();
        let mut payload = vec![0u8; snapshot::group_size(3).unwrap()];
        payload[0] = 0x02; // full charging
        payload[6..8].copy_from_slice(&900u16.to_be_bytes());
        payload[8..10].copy_from_slice(&1800u16.to_be_bytes());
        bench.push_bytes(&payload);

        let snap = driver.request_sensor_group(3).unwrap();
        assert_eq!(bench.sent(), vec![142, 3]);
        assert_eq!(snap.charging_state_label, "full_charging");
        assert_eq!(snap.battery_pct, 50);
    }

    #[test]
    fn test_closed_driver_rejects_commands() {
        let (driver, _bench) = bench_driver();
        driver.close();
        assert!(matches!(driver.stop(), Err(Error::Closed)));
    }
}
