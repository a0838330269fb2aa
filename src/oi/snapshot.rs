//! Typed sensor state decoded from Open Interface packets.
//!
//! The OI reports sensors as numbered packets with fixed byte counts.
//! Multi-byte values are big-endian, signed or unsigned per packet. Group
//! packets (0-6, 100-107) are concatenations of member packets in id order
//! and carry no inner ids of their own.
//!
//! A [`SensorSnapshot`] is persistent decoder state: packets overwrite the
//! fields they carry and everything else retains its last value, so a stream
//! built from a partial group still yields a complete snapshot.

use crate::error::{Error, Result};
use serde::Serialize;

// Packet ids used directly by the daemon.
pub const PKT_BUMPS_WHEEL_DROPS: u8 = 7;
pub const PKT_WALL: u8 = 8;
pub const PKT_CLIFF_LEFT: u8 = 9;
pub const PKT_CLIFF_FRONT_LEFT: u8 = 10;
pub const PKT_CLIFF_FRONT_RIGHT: u8 = 11;
pub const PKT_CLIFF_RIGHT: u8 = 12;
pub const PKT_DISTANCE: u8 = 19;
pub const PKT_ANGLE: u8 = 20;
pub const PKT_CHARGING_STATE: u8 = 21;
pub const PKT_VOLTAGE: u8 = 22;
pub const PKT_CURRENT: u8 = 23;
pub const PKT_BATTERY_CHARGE: u8 = 25;
pub const PKT_BATTERY_CAPACITY: u8 = 26;
pub const PKT_CHARGING_SOURCES: u8 = 34;
pub const PKT_OI_MODE: u8 = 35;
pub const PKT_SONG_NUMBER: u8 = 36;
pub const PKT_REQUESTED_VELOCITY: u8 = 39;
pub const PKT_REQUESTED_RADIUS: u8 = 40;
pub const PKT_LEFT_ENCODER: u8 = 43;
pub const PKT_RIGHT_ENCODER: u8 = 44;
pub const PKT_LIGHT_BUMPER: u8 = 45;

/// Fixed payload size of a single (non-group) sensor packet.
///
/// Table from the OI specification, packets 7-58.
pub fn packet_size(id: u8) -> Option<usize> {
    let size = match id {
        7..=18 => 1,
        19 | 20 => 2,
        21 => 1,
        22 | 23 => 2,
        24 => 1,
        25..=31 => 2,
        32 => 1,
        33 => 2,
        34..=38 => 1,
        39..=44 => 2,
        45 => 1,
        46..=51 => 2,
        52 | 53 => 1,
        54..=57 => 2,
        58 => 1,
        _ => return None,
    };
    Some(size)
}

/// Member packet ids of a group packet, in wire order.
pub fn group_members(id: u8) -> Option<std::ops::RangeInclusive<u8>> {
    let range = match id {
        0 => 7..=26,
        1 => 7..=16,
        2 => 17..=20,
        3 => 21..=26,
        4 => 27..=34,
        5 => 35..=42,
        6 => 7..=42,
        100 => 7..=58,
        101 => 43..=58,
        106 => 46..=51,
        107 => 54..=58,
        _ => return None,
    };
    Some(range)
}

/// Total payload size of a group packet.
pub fn group_size(id: u8) -> Option<usize> {
    group_members(id).map(|members| {
        members
            .map(|m| packet_size(m).unwrap_or(0))
            .sum()
    })
}

fn be_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn be_i16(data: &[u8]) -> i16 {
    i16::from_be_bytes([data[0], data[1]])
}

/// Decoded robot state, latest value per field.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    /// Server receive time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Whether the sensor link is currently delivering frames.
    pub link_alive: bool,

    // Bumpers and wheel drops (packet 7 bitmask)
    pub bump_left: bool,
    pub bump_right: bool,
    pub wheel_drop_left: bool,
    pub wheel_drop_right: bool,
    pub wheel_drop_caster: bool,

    // Cliff and wall sensors
    pub wall_seen: bool,
    pub cliff_left: bool,
    pub cliff_front_left: bool,
    pub cliff_front_right: bool,
    pub cliff_right: bool,

    // Charging
    pub charging_state: u8,
    pub charging_state_label: String,
    pub charging_source_internal: bool,
    pub charging_source_home_base: bool,
    /// Mirrors the home-base charging source bit.
    pub dock_visible: bool,

    // Battery
    pub voltage_mv: u16,
    pub current_ma: i16,
    pub battery_charge_mah: u16,
    pub battery_capacity_mah: u16,
    pub battery_pct: u8,

    // Motion
    /// Travel since the previous frame, millimetres.
    pub distance_mm: i16,
    /// Turn since the previous frame, degrees.
    pub angle_deg: i16,
    pub total_distance_mm: f64,
    pub total_angle_deg: f64,
    pub left_encoder_counts: u16,
    pub right_encoder_counts: u16,

    // Misc
    pub oi_mode: u8,
    pub light_bumper: u8,
    pub requested_velocity_mm_s: i16,
    pub requested_radius_mm: i16,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            timestamp_us: 0,
            link_alive: false,
            bump_left: false,
            bump_right: false,
            wheel_drop_left: false,
            wheel_drop_right: false,
            wheel_drop_caster: false,
            wall_seen: false,
            cliff_left: false,
            cliff_front_left: false,
            cliff_front_right: false,
            cliff_right: false,
            charging_state: 0,
            charging_state_label: charging_state_label(0).to_string(),
            charging_source_internal: false,
            charging_source_home_base: false,
            dock_visible: false,
            voltage_mv: 0,
            current_ma: 0,
            battery_charge_mah: 0,
            battery_capacity_mah: 0,
            battery_pct: 0,
            distance_mm: 0,
            angle_deg: 0,
            total_distance_mm: 0.0,
            total_angle_deg: 0.0,
            left_encoder_counts: 0,
            right_encoder_counts: 0,
            oi_mode: 0,
            light_bumper: 0,
            requested_velocity_mm_s: 0,
            requested_radius_mm: 0,
        }
    }
}

/// Human-readable label for the OI charging state code.
pub fn charging_state_label(code: u8) -> &'static str {
    match code {
        0 => "not_charging",
        1 => "reconditioning",
        2 => "full_charging",
        3 => "trickle_charging",
        4 => "waiting",
        5 => "fault",
        _ => "unknown",
    }
}

impl SensorSnapshot {
    /// Update the receive timestamp to the current wall clock.
    pub fn touch(&mut self) {
        self.timestamp_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
    }

    /// Whether either bumper is pressed.
    pub fn any_bump(&self) -> bool {
        self.bump_left || self.bump_right
    }

    /// Whether a wheel drop or cliff sensor is active.
    pub fn any_hazard(&self) -> bool {
        self.wheel_drop_left
            || self.wheel_drop_right
            || self.wheel_drop_caster
            || self.cliff_left
            || self.cliff_front_left
            || self.cliff_front_right
            || self.cliff_right
    }

    /// Apply one sensor packet's value bytes. Group ids expand to members.
    pub fn apply_packet(&mut self, id: u8, data: &[u8]) -> Result<()> {
        if group_members(id).is_some() {
            return self.apply_group(id, data);
        }
        let size = packet_size(id)
            .ok_or_else(|| Error::DecoderInconsistent(format!("unknown packet id {}", id)))?;
        if data.len() != size {
            return Err(Error::DecoderInconsistent(format!(
                "packet {} expects {} bytes, got {}",
                id,
                size,
                data.len()
            )));
        }

        match id {
            PKT_BUMPS_WHEEL_DROPS => {
                let bits = data[0];
                self.bump_right = bits & 0x01 != 0;
                self.bump_left = bits & 0x02 != 0;
                self.wheel_drop_right = bits & 0x04 != 0;
                self.wheel_drop_left = bits & 0x08 != 0;
                self.wheel_drop_caster = bits & 0x10 != 0;
            }
            PKT_WALL => self.wall_seen = data[0] != 0,
            PKT_CLIFF_LEFT => self.cliff_left = data[0] != 0,
            PKT_CLIFF_FRONT_LEFT => self.cliff_front_left = data[0] != 0,
            PKT_CLIFF_FRONT_RIGHT => self.cliff_front_right = data[0] != 0,
            PKT_CLIFF_RIGHT => self.cliff_right = data[0] != 0,
            PKT_DISTANCE => {
                self.distance_mm = be_i16(data);
                self.total_distance_mm += self.distance_mm as f64;
            }
            PKT_ANGLE => {
                self.angle_deg = be_i16(data);
                self.total_angle_deg += self.angle_deg as f64;
            }
            PKT_CHARGING_STATE => {
                self.charging_state = data[0];
                self.charging_state_label = charging_state_label(data[0]).to_string();
            }
            PKT_VOLTAGE => self.voltage_mv = be_u16(data),
            PKT_CURRENT => self.current_ma = be_i16(data),
            PKT_BATTERY_CHARGE => {
                self.battery_charge_mah = be_u16(data);
                self.recompute_battery_pct();
            }
            PKT_BATTERY_CAPACITY => {
                self.battery_capacity_mah = be_u16(data);
                self.recompute_battery_pct();
            }
            PKT_CHARGING_SOURCES => {
                let bits = data[0];
                self.charging_source_internal = bits & 0x01 != 0;
                self.charging_source_home_base = bits & 0x02 != 0;
                self.dock_visible = self.charging_source_home_base;
            }
            PKT_OI_MODE => self.oi_mode = data[0],
            PKT_REQUESTED_VELOCITY => self.requested_velocity_mm_s = be_i16(data),
            PKT_REQUESTED_RADIUS => self.requested_radius_mm = be_i16(data),
            PKT_LEFT_ENCODER => self.left_encoder_counts = be_u16(data),
            PKT_RIGHT_ENCODER => self.right_encoder_counts = be_u16(data),
            PKT_LIGHT_BUMPER => self.light_bumper = data[0],
            // Known size, no snapshot field: consume silently.
            _ => {}
        }
        Ok(())
    }

    /// Apply a group payload: member packets concatenated without inner ids
    /// (the response shape of a Sensors/opcode-142 query).
    pub fn apply_group(&mut self, group_id: u8, data: &[u8]) -> Result<()> {
        let members = group_members(group_id)
            .ok_or_else(|| Error::DecoderInconsistent(format!("unknown group {}", group_id)))?;
        let expected = group_size(group_id).unwrap_or(0);
        if data.len() != expected {
            return Err(Error::DecoderInconsistent(format!(
                "group {} expects {} bytes, got {}",
                group_id,
                expected,
                data.len()
            )));
        }
        let mut offset = 0;
        for member in members {
            let size = packet_size(member).unwrap_or(0);
            self.apply_packet(member, &data[offset..offset + size])?;
            offset += size;
        }
        Ok(())
    }

    /// Apply a stream payload: `[id][value bytes]` repeated.
    pub fn apply_stream_payload(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < payload.len() {
            let id = payload[offset];
            offset += 1;
            let size = if let Some(size) = group_size(id) {
                size
            } else {
                packet_size(id).ok_or_else(|| {
                    Error::DecoderInconsistent(format!("unknown packet id {}", id))
                })?
            };
            if offset + size > payload.len() {
                return Err(Error::DecoderInconsistent(format!(
                    "packet {} truncated ({} of {} bytes)",
                    id,
                    payload.len() - offset,
                    size
                )));
            }
            self.apply_packet(id, &payload[offset..offset + size])?;
            offset += size;
        }
        self.touch();
        Ok(())
    }

    fn recompute_battery_pct(&mut self) {
        self.battery_pct = if self.battery_capacity_mah > 0 {
            ((self.battery_charge_mah as u32 * 100) / self.battery_capacity_mah as u32).min(100)
                as u8
        } else {
            0
        };
    }
}
