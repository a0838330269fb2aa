//! Open Interface command opcodes and encoders.
//!
//! Wire format per the iRobot OI specification: a single opcode byte followed
//! by fixed-size operands. Drive operands are signed big-endian 16-bit words.

pub const CMD_START: u8 = 128;
pub const CMD_BAUD: u8 = 129;
pub const CMD_SAFE: u8 = 131;
pub const CMD_FULL: u8 = 132;
pub const CMD_POWER: u8 = 133;
pub const CMD_CLEAN: u8 = 135;
pub const CMD_DRIVE: u8 = 137;
pub const CMD_SENSORS: u8 = 142;
pub const CMD_DOCK: u8 = 143;
pub const CMD_STREAM: u8 = 148;
pub const CMD_QUERY_LIST: u8 = 149;
pub const CMD_PAUSE_RESUME_STREAM: u8 = 150;

/// Velocity bound enforced on every drive command, mm/s.
pub const MAX_VELOCITY_MM_S: i32 = 500;
/// Largest meaningful turn radius, mm.
pub const MAX_RADIUS_MM: i32 = 2000;

/// Special radius: drive straight.
pub const RADIUS_STRAIGHT: i32 = 32768;
/// Special radius: spin counter-clockwise in place.
pub const RADIUS_SPIN_CCW: i32 = 1;
/// Special radius: spin clockwise in place.
pub const RADIUS_SPIN_CW: i32 = -1;

/// OI operating mode selected by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OiMode {
    Safe,
    Full,
}

impl OiMode {
    pub fn opcode(self) -> u8 {
        match self {
            OiMode::Safe => CMD_SAFE,
            OiMode::Full => CMD_FULL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OiMode::Safe => "safe",
            OiMode::Full => "full",
        }
    }
}

/// A clamped, encodable drive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveParams {
    pub velocity_mm_s: i16,
    pub radius_mm: i32,
}

impl DriveParams {
    /// Clamp a raw operator request into the encodable range.
    ///
    /// Velocity clamps to ±500 mm/s. The radius special values (32768
    /// straight, ±1 spin in place) pass through unchanged; everything else
    /// clamps to ±2000 mm.
    pub fn clamped(velocity_mm_s: i32, radius_mm: i32) -> Self {
        let velocity = velocity_mm_s.clamp(-MAX_VELOCITY_MM_S, MAX_VELOCITY_MM_S) as i16;
        let radius = match radius_mm {
            RADIUS_STRAIGHT | RADIUS_SPIN_CCW | RADIUS_SPIN_CW => radius_mm,
            r => r.clamp(-MAX_RADIUS_MM, MAX_RADIUS_MM),
        };
        Self {
            velocity_mm_s: velocity,
            radius_mm: radius,
        }
    }

    /// The stop request: zero velocity, straight radius.
    pub fn stop() -> Self {
        Self {
            velocity_mm_s: 0,
            radius_mm: RADIUS_STRAIGHT,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.velocity_mm_s == 0
    }

    /// Encode as a Drive command: opcode then two signed BE words.
    /// The straight radius 32768 encodes as 0x8000.
    pub fn encode(&self) -> [u8; 5] {
        let radius_word = if self.radius_mm == RADIUS_STRAIGHT {
            0x8000u16
        } else {
            self.radius_mm as i16 as u16
        };
        let velocity = self.velocity_mm_s.to_be_bytes();
        let radius = radius_word.to_be_bytes();
        [CMD_DRIVE, velocity[0], velocity[1], radius[0], radius[1]]
    }

    /// Decode a Drive wire command back into parameters.
    pub fn decode(wire: &[u8; 5]) -> Option<Self> {
        if wire[0] != CMD_DRIVE {
            return None;
        }
        let velocity = i16::from_be_bytes([wire[1], wire[2]]);
        let radius_word = u16::from_be_bytes([wire[3], wire[4]]);
        let radius = if radius_word == 0x8000 {
            RADIUS_STRAIGHT
        } else {
            radius_word as i16 as i32
        };
        Some(Self {
            velocity_mm_s: velocity,
            radius_mm: radius,
        })
    }
}

/// Encode a stream request for a single packet (or group packet) id.
pub fn encode_stream_request(packet_id: u8) -> [u8; 3] {
    [CMD_STREAM, 1, packet_id]
}

/// Encode a stream pause (`false`) / resume (`true`) command.
pub fn encode_stream_state(resume: bool) -> [u8; 2] {
    [CMD_PAUSE_RESUME_STREAM, resume as u8]
}

/// Encode a one-shot sensor query for a packet or group id.
pub fn encode_sensor_query(packet_id: u8) -> [u8; 2] {
    [CMD_SENSORS, packet_id]
}

/// Encode a query for an explicit list of packet ids.
pub fn encode_query_list(packet_ids: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(2 + packet_ids.len());
    wire.push(CMD_QUERY_LIST);
    wire.push(packet_ids.len() as u8);
    wire.extend_from_slice(packet_ids);
    wire
}

/// Encode a baud change. `code` is the OI baud table index (11 = 115200).
pub fn encode_baud(code: u8) -> [u8; 2] {
    [CMD_BAUD, code]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_roundtrip_clamps_velocity() {
        let params = DriveParams::clamped(900, 250);
        let decoded = DriveParams::decode(&params.encode()).unwrap();
        assert_eq!(decoded.velocity_mm_s, 500);
        assert_eq!(decoded.radius_mm, 250);
    }

    #[test]
    fn test_drive_roundtrip_preserves_special_radii() {
        for radius in [RADIUS_STRAIGHT, RADIUS_SPIN_CCW, RADIUS_SPIN_CW] {
            let params = DriveParams::clamped(-200, radius);
            let decoded = DriveParams::decode(&params.encode()).unwrap();
            assert_eq!(decoded.velocity_mm_s, -200);
            assert_eq!(decoded.radius_mm, radius);
        }
    }

    #[test]
    fn test_negative_velocity_encodes_big_endian() {
        let params = DriveParams::clamped(-200, 500);
        let wire = params.encode();
        // -200 = 0xFF38
        assert_eq!(wire, [CMD_DRIVE, 0xFF, 0x38, 0x01, 0xF4]);
    }

    #[test]
    fn test_stop_is_straight_zero() {
        let wire = DriveParams::stop().encode();
        assert_eq!(wire, [CMD_DRIVE, 0x00, 0x00, 0x80, 0x00]);
    }

    #[test]
    fn test_large_radius_clamps() {
        let params = DriveParams::clamped(100, 5000);
        assert_eq!(params.radius_mm, 2000);
    }

    #[test]
    fn test_query_list_wire_shape() {
        assert_eq!(encode_query_list(&[7, 19, 20]), vec![149, 3, 7, 19, 20]);
        assert_eq!(encode_baud(11), [129, 11]);
    }
}
