//! Sensor stream framing.
//!
//! Stream frames have the envelope `[19][len][payload...][checksum]` where
//! the byte sum of the whole frame, checksum included, is 0 modulo 256.
//! Framing is a state machine over a byte buffer with explicit resync: a
//! frame is rejected purely on checksum and length consistency, never on
//! timing.

use crate::error::{Error, Result};

/// Stream frame header byte.
pub const FRAME_HEADER: u8 = 19;

/// Largest payload the decoder will wait for. Real frames for the group
/// packets in use stay well below this; a larger length byte is treated as
/// garbage so resync does not stall on it.
const MAX_FRAME_PAYLOAD: usize = 172;

/// Consecutive resyncs tolerated before the link is declared broken.
pub const MAX_CONSECUTIVE_RESYNCS: u32 = 10;

/// Incremental frame reassembler with resync counting.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    consecutive_resyncs: u32,
    total_resyncs: u64,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
            consecutive_resyncs: 0,
            total_resyncs: 0,
        }
    }

    /// Append raw bytes read from the port.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes discarded hunting for a valid header since startup.
    pub fn total_resyncs(&self) -> u64 {
        self.total_resyncs
    }

    /// Count a frame the payload decoder rejected against the resync budget.
    pub fn count_decode_failure(&mut self) -> Result<()> {
        self.bump_resync()
    }

    /// Try to extract the next checksum-valid payload.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Every discarded byte
    /// counts as one resync; [`MAX_CONSECUTIVE_RESYNCS`] in a row without a
    /// valid frame yields [`Error::FramingExceeded`].
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.buffer.len() < 2 {
                return Ok(None);
            }
            if self.buffer[0] != FRAME_HEADER {
                self.discard_one()?;
                continue;
            }
            let len = self.buffer[1] as usize;
            if len == 0 || len > MAX_FRAME_PAYLOAD {
                self.discard_one()?;
                continue;
            }
            let total = 2 + len + 1;
            if self.buffer.len() < total {
                return Ok(None);
            }
            let sum: u32 = self.buffer[..total].iter().map(|&b| b as u32).sum();
            if sum % 256 != 0 {
                self.discard_one()?;
                continue;
            }
            let payload = self.buffer[2..2 + len].to_vec();
            self.buffer.drain(..total);
            self.consecutive_resyncs = 0;
            return Ok(Some(payload));
        }
    }

    fn discard_one(&mut self) -> Result<()> {
        self.buffer.remove(0);
        self.bump_resync()
    }

    fn bump_resync(&mut self) -> Result<()> {
        self.consecutive_resyncs += 1;
        self.total_resyncs += 1;
        if self.consecutive_resyncs >= MAX_CONSECUTIVE_RESYNCS {
            self.consecutive_resyncs = 0;
            return Err(Error::FramingExceeded);
        }
        Ok(())
    }
}

/// Build a valid stream frame around a payload (test and simulator helper).
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(FRAME_HEADER);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    let sum: u32 = frame.iter().map(|&b| b as u32).sum();
    frame.push((256 - (sum % 256) as u16) as u8);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_frame() {
        let mut reader = FrameReader::new();
        let payload = [7u8, 0x00, 8, 0x01];
        reader.push_bytes(&build_frame(&payload));
        assert_eq!(reader.next_frame().unwrap().unwrap(), payload);
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut reader = FrameReader::new();
        let frame = build_frame(&[7, 0x03]);
        reader.push_bytes(&frame[..3]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.push_bytes(&frame[3..]);
        assert!(reader.next_frame().unwrap().is_some());
        assert_eq!(reader.total_resyncs(), 0);
    }

    #[test]
    fn test_garbage_before_frame_counts_resyncs() {
        let mut reader = FrameReader::new();
        reader.push_bytes(&[0xAA, 0xBB, 0xCC]);
        reader.push_bytes(&build_frame(&[8, 0x01]));
        assert_eq!(reader.next_frame().unwrap().unwrap(), vec![8, 0x01]);
        assert_eq!(reader.total_resyncs(), 3);
    }

    #[test]
    fn test_bad_checksum_discards_and_recovers() {
        let mut reader = FrameReader::new();
        let mut corrupted = build_frame(&[8, 0x01]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        reader.push_bytes(&corrupted);
        reader.push_bytes(&build_frame(&[8, 0x01]));
        assert_eq!(reader.next_frame().unwrap().unwrap(), vec![8, 0x01]);
        assert!(reader.total_resyncs() > 0);
    }

    #[test]
    fn test_sustained_garbage_exceeds_framing_budget() {
        let mut reader = FrameReader::new();
        reader.push_bytes(&[0x55; 64]);
        let mut saw_error = false;
        for _ in 0..8 {
            match reader.next_frame() {
                Err(Error::FramingExceeded) => {
                    saw_error = true;
                    break;
                }
                Ok(None) => break,
                _ => {}
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn test_header_inside_garbage_not_taken_as_packet_id() {
        // A stray 19 followed by a bogus length must not produce a frame.
        let mut reader = FrameReader::new();
        reader.push_bytes(&[FRAME_HEADER, 0x00, 0x12]);
        reader.push_bytes(&build_frame(&[8, 0x00]));
        let frame = loop {
            match reader.next_frame() {
                Ok(Some(frame)) => break frame,
                Ok(None) => panic!("expected a frame"),
                Err(_) => continue,
            }
        };
        assert_eq!(frame, vec![8, 0x00]);
    }
}
