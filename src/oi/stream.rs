//! Sensor stream reader and link supervisor.
//!
//! The reader thread pulls bytes off the serial link, reassembles frames
//! ([`super::frame::FrameReader`]), decodes them into the shared snapshot,
//! and publishes to the latest-wins slot plus every frame subscriber.
//!
//! # Self-Healing
//!
//! The link is declared broken when:
//! - no checksum-valid frame arrives for 5 stream periods, or
//! - framing needs 10 consecutive resyncs, or
//! - a frame subscriber lags more than 200 ms (its queue must never drop).
//!
//! Recovery pauses the stream, reopens the port, replays `start` + `safe` +
//! the stream request, and bumps `restart_count`. Attempts back off from
//! 100 ms to 1 s, doubling, so a missing robot does not spin the thread.

use super::commands::{encode_stream_request, encode_stream_state, CMD_SAFE, CMD_START};
use super::frame::FrameReader;
use super::snapshot::SensorSnapshot;
use super::LinkPort;
use crate::error::Error;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Stream periods without a frame before the link restarts.
const STALL_PERIODS: u32 = 5;
/// Longest a frame subscriber may lag before the link restarts.
const MAX_CONSUMER_LAG: Duration = Duration::from_millis(200);
/// Recovery back-off bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Shared health state of the sensor link.
///
/// Updated by the reader thread, read by telemetry and the driver.
pub struct StreamHealth {
    restart_count: AtomicU32,
    period_us: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            restart_count: AtomicU32::new(0),
            period_us: AtomicU64::new(50_000),
            last_frame: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn set_period(&self, period: Duration) {
        self.period_us
            .store(period.as_micros() as u64, Ordering::Relaxed);
    }

    fn period(&self) -> Duration {
        Duration::from_micros(self.period_us.load(Ordering::Relaxed))
    }

    pub(crate) fn record_frame(&self) {
        if let Ok(mut guard) = self.last_frame.lock() {
            *guard = Some(Instant::now());
        }
    }

    pub(crate) fn record_error(&self, message: String) {
        log::warn!("Sensor link: {}", message);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(message);
        }
    }

    pub(crate) fn record_restart(&self) {
        self.restart_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The link is alive while frames keep arriving within 3 periods.
    pub fn alive(&self) -> bool {
        self.last_update_age()
            .map(|age| age <= self.period() * 3)
            .unwrap_or(false)
    }

    pub fn last_update_age(&self) -> Option<Duration> {
        self.last_frame
            .lock()
            .ok()
            .and_then(|guard| guard.map(|at| at.elapsed()))
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }

    /// Flat report embedded in every telemetry snapshot.
    pub fn report(&self) -> StreamHealthReport {
        StreamHealthReport {
            sensor_stream_alive: self.alive(),
            sensor_stream_age_ms: self
                .last_update_age()
                .map(|age| age.as_millis() as u64),
            sensor_stream_restarts: self.restart_count(),
            sensor_stream_last_error: self.last_error(),
        }
    }
}

/// Telemetry view of [`StreamHealth`].
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealthReport {
    pub sensor_stream_alive: bool,
    pub sensor_stream_age_ms: Option<u64>,
    pub sensor_stream_restarts: u32,
    pub sensor_stream_last_error: Option<String>,
}

/// Everything the reader thread needs, cloned out of the driver.
pub(crate) struct StreamContext {
    pub link: Arc<LinkPort>,
    pub shutdown: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
    pub health: Arc<StreamHealth>,
    pub latest: Arc<Mutex<SensorSnapshot>>,
    pub frame_senders: Arc<Mutex<Vec<Sender<SensorSnapshot>>>>,
    pub group_id: u8,
    pub period: Duration,
}

/// Reader loop - reassembles frames and supervises the link.
pub(crate) fn reader_loop(ctx: StreamContext) {
    let mut reader = FrameReader::new();
    let mut snapshot = ctx
        .latest
        .lock()
        .map(|s| s.clone())
        .unwrap_or_default();
    let mut last_frame = Instant::now();
    let mut backoff = BACKOFF_INITIAL;
    let mut buf = [0u8; 256];

    while !ctx.shutdown.load(Ordering::Relaxed) && !ctx.closed.load(Ordering::Relaxed) {
        match ctx.link.read(&mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(2)),
            Ok(n) => reader.push_bytes(&buf[..n]),
            Err(e) => {
                ctx.health.record_error(format!("read failed: {}", e));
                restart_link(&ctx, &mut reader, &mut backoff, &mut last_frame);
                continue;
            }
        }

        loop {
            match reader.next_frame() {
                Ok(Some(payload)) => match snapshot.apply_stream_payload(&payload) {
                    Ok(()) => {
                        snapshot.link_alive = true;
                        publish(&ctx, &snapshot);
                        ctx.health.record_frame();
                        last_frame = Instant::now();
                        backoff = BACKOFF_INITIAL;
                    }
                    Err(e) => {
                        // Checksum-valid but undecodable: spend resync budget.
                        ctx.health.record_error(e.to_string());
                        if reader.count_decode_failure().is_err() {
                            ctx.health
                                .record_error(Error::FramingExceeded.to_string());
                            restart_link(&ctx, &mut reader, &mut backoff, &mut last_frame);
                            break;
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    ctx.health.record_error(e.to_string());
                    restart_link(&ctx, &mut reader, &mut backoff, &mut last_frame);
                    break;
                }
            }
        }

        if last_frame.elapsed() > ctx.period * STALL_PERIODS {
            ctx.health.record_error(format!(
                "no sensor frame for {} stream periods",
                STALL_PERIODS
            ));
            restart_link(&ctx, &mut reader, &mut backoff, &mut last_frame);
        } else if let Some(lag) = worst_consumer_lag(&ctx) {
            if lag > MAX_CONSUMER_LAG {
                ctx.health.record_error(format!(
                    "frame consumer lagging {} ms",
                    lag.as_millis()
                ));
                restart_link(&ctx, &mut reader, &mut backoff, &mut last_frame);
            }
        }
    }

    log::info!("Stream reader exiting");
}

/// Publish a decoded frame to the latest slot and every subscriber.
fn publish(ctx: &StreamContext, snapshot: &SensorSnapshot) {
    if let Ok(mut latest) = ctx.latest.lock() {
        *latest = snapshot.clone();
    }
    if let Ok(mut senders) = ctx.frame_senders.lock() {
        senders.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// Estimated lag of the slowest frame subscriber, from its queue depth.
fn worst_consumer_lag(ctx: &StreamContext) -> Option<Duration> {
    let senders = ctx.frame_senders.lock().ok()?;
    senders
        .iter()
        .map(|tx| ctx.period * tx.len() as u32)
        .max()
}

/// Tear the link down and bring the stream back up, with back-off.
fn restart_link(
    ctx: &StreamContext,
    reader: &mut FrameReader,
    backoff: &mut Duration,
    last_frame: &mut Instant,
) {
    if ctx.shutdown.load(Ordering::Relaxed) || ctx.closed.load(Ordering::Relaxed) {
        return;
    }
    ctx.health.record_restart();
    let attempt = ctx.health.restart_count();
    log::warn!(
        "Restarting sensor link (attempt {}, back-off {} ms)",
        attempt,
        backoff.as_millis()
    );

    let _ = ctx.link.write(&encode_stream_state(false));
    ctx.link.disconnect();
    thread::sleep(*backoff);
    *backoff = (*backoff * 2).min(BACKOFF_MAX);

    let result = ctx
        .link
        .connect()
        .and_then(|_| ctx.link.write(&[CMD_START]))
        .and_then(|_| ctx.link.write(&[CMD_SAFE]))
        .and_then(|_| ctx.link.write(&encode_stream_request(ctx.group_id)));
    match result {
        Ok(()) => log::info!("Sensor link restarted"),
        Err(e) => ctx.health.record_error(format!("restart failed: {}", e)),
    }

    *reader = FrameReader::new();
    *last_frame = Instant::now();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_alive_window() {
        let health = StreamHealth::new();
        health.set_period(Duration::from_millis(50));
        assert!(!health.alive());
        health.record_frame();
        assert!(health.alive());
    }

    #[test]
    fn test_report_carries_error_string() {
        let health = StreamHealth::new();
        health.record_error("no sensor frame for 5 stream periods".to_string());
        health.record_restart();
        let report = health.report();
        assert!(!report.sensor_stream_alive);
        assert_eq!(report.sensor_stream_restarts, 1);
        assert!(report
            .sensor_stream_last_error
            .unwrap()
            .contains("no sensor frame"));
    }
}
