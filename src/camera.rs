//! Latest camera frame slot.
//!
//! The camera capture pipeline lives in an external process; this daemon only
//! consumes its output. [`FrameSlot`] is the process-local handoff point: a
//! single latest-wins JPEG buffer plus the time it arrived. The optional file
//! poller feeds the slot from a "latest frame" file that the external
//! pipeline keeps overwriting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

struct FrameBuf {
    jpeg: Arc<Vec<u8>>,
    received_at: Instant,
}

/// One-writer latest-wins slot for the newest JPEG frame.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<Option<FrameBuf>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame. Empty buffers are ignored.
    pub fn publish(&self, jpeg: Vec<u8>) {
        if jpeg.is_empty() {
            return;
        }
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(FrameBuf {
            jpeg: Arc::new(jpeg),
            received_at: Instant::now(),
        });
    }

    /// The newest frame and its age, if any frame has arrived.
    pub fn latest(&self) -> Option<(Arc<Vec<u8>>, Duration)> {
        let slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .map(|f| (Arc::clone(&f.jpeg), f.received_at.elapsed()))
    }
}

/// Polls a "latest JPEG" file into a [`FrameSlot`].
///
/// The external camera process overwrites the file in place; the poller
/// republishes whenever the modification time advances.
pub struct FrameFilePoller {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameFilePoller {
    pub fn spawn(path: PathBuf, slot: FrameSlot, period: Duration) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("camera-frame-poller".to_string())
            .spawn(move || {
                let mut last_mtime: Option<SystemTime> = None;
                while !thread_shutdown.load(Ordering::Relaxed) {
                    match std::fs::metadata(&path).and_then(|m| m.modified()) {
                        Ok(mtime) if last_mtime != Some(mtime) => {
                            match std::fs::read(&path) {
                                Ok(bytes) => {
                                    last_mtime = Some(mtime);
                                    slot.publish(bytes);
                                }
                                Err(e) => log::debug!("Frame file read failed: {}", e),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::trace!("Frame file not available: {}", e),
                    }
                    thread::sleep(period);
                }
                log::info!("Camera frame poller exiting");
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for FrameFilePoller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_latest_wins() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        slot.publish(vec![1, 2, 3]);
        slot.publish(vec![4, 5]);
        let (frame, age) = slot.latest().unwrap();
        assert_eq!(frame.as_slice(), &[4, 5]);
        assert!(age < Duration::from_secs(1));
    }

    #[test]
    fn test_empty_frames_ignored() {
        let slot = FrameSlot::new();
        slot.publish(Vec::new());
        assert!(slot.latest().is_none());
    }
}
