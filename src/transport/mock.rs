//! Bench-side simulator of the robot end of the OI link.
//!
//! Plays what a Roomba on a bench cable would: scripted read bursts
//! (checksum-valid stream envelopes, raw query responses, line noise),
//! quiet stretches that read as timeouts, UART-sized partial reads, and
//! injectable write faults. Clones share one line, so a test keeps a handle
//! on the robot side while the driver owns the host side, across link
//! reopens.

use super::Transport;
use crate::error::{Error, Result};
use crate::oi::frame::build_frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum ReadStep {
    /// Bytes arriving in one burst (one `read` call, unless burst-limited).
    Burst(Vec<u8>),
    /// A quiet line: one `read` returning 0, like a serial timeout.
    Quiet,
}

#[derive(Default)]
struct BenchState {
    script: VecDeque<ReadStep>,
    sent: Vec<u8>,
    burst_limit: Option<usize>,
    write_faults: u32,
}

/// Scripted robot end of the serial link.
#[derive(Clone, Default)]
pub struct BenchLink {
    state: Arc<Mutex<BenchState>>,
}

impl BenchLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a sensor stream frame: `payload` wrapped in the header/length/
    /// checksum envelope the real robot emits.
    pub fn push_frame(&self, payload: &[u8]) {
        self.push_bytes(&build_frame(payload));
    }

    /// Queue raw bytes: a group query response, or line noise for resync
    /// tests.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.script.push_back(ReadStep::Burst(bytes.to_vec()));
    }

    /// Queue `reads` timeouts before whatever is scripted next.
    pub fn push_quiet(&self, reads: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..reads {
            state.script.push_back(ReadStep::Quiet);
        }
    }

    /// Deliver at most `bytes` per read from here on, like a small UART
    /// FIFO splitting frames across reads.
    pub fn limit_burst(&self, bytes: usize) {
        self.state.lock().unwrap().burst_limit = Some(bytes.max(1));
    }

    /// Fail the next `count` writes, as an unplugged adapter would.
    pub fn fail_writes(&self, count: u32) {
        self.state.lock().unwrap().write_faults = count;
    }

    /// Everything the driver has written, in order.
    pub fn sent(&self) -> Vec<u8> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Drain the sent log, returning what was captured so far.
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().sent)
    }

    /// Whether the driver has issued a stream request for `packet_id`
    /// (opcode 148 with a single-entry list).
    pub fn saw_stream_request(&self, packet_id: u8) -> bool {
        let state = self.state.lock().unwrap();
        state
            .sent
            .windows(3)
            .any(|w| w == [148, 1, packet_id])
    }
}

impl Transport for BenchLink {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let cap = state
            .burst_limit
            .map_or(buffer.len(), |limit| limit.min(buffer.len()));
        match state.script.pop_front() {
            None | Some(ReadStep::Quiet) => Ok(0),
            Some(ReadStep::Burst(mut bytes)) => {
                if bytes.len() <= cap {
                    buffer[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                } else {
                    // Partial read: the tail arrives on later reads.
                    let rest = bytes.split_off(cap);
                    buffer[..cap].copy_from_slice(&bytes);
                    state.script.push_front(ReadStep::Burst(rest));
                    Ok(cap)
                }
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.write_faults > 0 {
            state.write_faults -= 1;
            return Err(Error::PortUnavailable("bench link write fault".into()));
        }
        state.sent.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oi::frame::FrameReader;

    #[test]
    fn test_pushed_frames_reassemble_through_the_frame_reader() {
        let bench = BenchLink::new();
        bench.push_frame(&[7, 0x01]);
        bench.push_frame(&[8, 0x00]);

        let mut link: Box<dyn Transport> = Box::new(bench.clone());
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 64];
        for _ in 0..4 {
            let n = link.read(&mut buf).unwrap();
            reader.push_bytes(&buf[..n]);
        }
        assert_eq!(reader.next_frame().unwrap().unwrap(), vec![7, 0x01]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), vec![8, 0x00]);
        assert_eq!(reader.total_resyncs(), 0);
    }

    #[test]
    fn test_burst_limit_splits_a_frame_across_reads() {
        let bench = BenchLink::new();
        bench.limit_burst(2);
        bench.push_frame(&[7, 0x03]);

        let mut link: Box<dyn Transport> = Box::new(bench.clone());
        let mut buf = [0u8; 64];
        let mut chunks = Vec::new();
        loop {
            let n = link.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            chunks.push(n);
        }
        // 5-byte envelope delivered 2 + 2 + 1.
        assert_eq!(chunks, vec![2, 2, 1]);
    }

    #[test]
    fn test_quiet_line_reads_as_timeouts() {
        let bench = BenchLink::new();
        bench.push_quiet(2);
        bench.push_bytes(&[0xAA]);

        let mut link: Box<dyn Transport> = Box::new(bench.clone());
        let mut buf = [0u8; 8];
        assert_eq!(link.read(&mut buf).unwrap(), 0);
        assert_eq!(link.read(&mut buf).unwrap(), 0);
        assert_eq!(link.read(&mut buf).unwrap(), 1);
        assert_eq!(link.read(&mut buf).unwrap(), 0); // idle again
    }

    #[test]
    fn test_write_fault_then_recovery() {
        let bench = BenchLink::new();
        bench.fail_writes(1);

        let mut link: Box<dyn Transport> = Box::new(bench.clone());
        assert!(link.write(&[128]).is_err());
        assert!(link.write(&[128]).is_ok());
        assert_eq!(bench.sent(), vec![128]);
    }

    #[test]
    fn test_sent_log_drains() {
        let bench = BenchLink::new();
        let mut link: Box<dyn Transport> = Box::new(bench.clone());
        link.write(&[148, 1, 100]).unwrap();
        assert!(bench.saw_stream_request(100));
        assert_eq!(bench.take_sent(), vec![148, 1, 100]);
        assert!(bench.sent().is_empty());
    }
}
