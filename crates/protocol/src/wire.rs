//! Wire message types.
//!
//! Fixed-layout headers carry the fields every message has. Optional fields
//! are announced in an [`OptionalFields`] mask and appended after the header
//! in bit order, so a peer skips trailing fields it does not know.

use bincode::{Decode, Encode};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use stride_physics::collision::ObjectId;
use stride_physics::movement::{MotionMode, MoveFlags, MoveInput};

use crate::quantize::{decompress_rotation, decompress_unit_vector};

/// Current protocol version. Frames from other versions are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Per-move control bits that are not movement requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ControlBits(pub u8);

impl ControlBits {
    /// Client asks the server to accept its position (situational authority).
    pub const AUTHORITY_REQUEST: u8 = 1 << 0;

    /// Client faces the control rotation exactly.
    pub const PRECISE_ROTATION: u8 = 1 << 1;

    /// Client's local clock monitor saw its time being tampered with.
    pub const TIME_TAMPER: u8 = 1 << 2;

    #[inline]
    pub fn has(self, bit: u8) -> bool {
        (self.0 & bit) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Which optional fields follow a header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct OptionalFields(pub u8);

impl OptionalFields {
    /// Move: external impulse at move start.
    pub const IMPULSE: u8 = 1 << 0;

    /// Move: timestamp of the last correction the client applied.
    pub const ACKED_CORRECTION: u8 = 1 << 1;

    /// Correction: object the entity stands on.
    pub const BASE: u8 = 1 << 2;

    /// Correction: impulse the client must adopt.
    pub const IMPULSE_OVERRIDE: u8 = 1 << 3;

    /// Bits this version understands.
    pub const KNOWN: u8 = Self::IMPULSE | Self::ACKED_CORRECTION | Self::BASE | Self::IMPULSE_OVERRIDE;

    #[inline]
    pub fn has(self, bit: u8) -> bool {
        (self.0 & bit) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// One client move as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMove {
    /// Client time at the end of the move, strictly increasing.
    pub timestamp: f64,
    pub delta_time: f32,
    /// Quantized movement intent.
    pub acceleration: [i8; 3],
    /// Movement request flags (without the authority request).
    pub flags: u8,
    pub control: ControlBits,
    /// Quantized control rotation (yaw, pitch, roll).
    pub rotation: [u16; 3],
    /// Where the client ended up.
    pub client_position: [f32; 3],
    pub client_mode: u8,
    /// External impulse at move start, when non-zero.
    pub impulse: Option<[f32; 3]>,
    /// Timestamp of the newest correction the client has applied.
    pub acked_correction: Option<f64>,
}

impl WireMove {
    /// Rebuild the simulation input this move was predicted with.
    pub fn input(&self) -> MoveInput {
        let mut flags = MoveFlags(self.flags & !MoveFlags::WANTS_AUTHORITY);
        if self.control.has(ControlBits::AUTHORITY_REQUEST) {
            flags.press(MoveFlags::WANTS_AUTHORITY);
        }
        MoveInput {
            acceleration: decompress_unit_vector(self.acceleration),
            control_rotation: decompress_rotation(self.rotation),
            flags,
            precise_rotation: self.control.has(ControlBits::PRECISE_ROTATION),
        }
    }

    pub fn client_position(&self) -> Vec3 {
        Vec3::from_array(self.client_position)
    }

    pub fn client_mode(&self) -> Option<MotionMode> {
        MotionMode::unpack(self.client_mode)
    }

    pub fn impulse(&self) -> Vec3 {
        self.impulse.map(Vec3::from_array).unwrap_or(Vec3::ZERO)
    }

    #[inline]
    pub fn wants_authority(&self) -> bool {
        self.control.has(ControlBits::AUTHORITY_REQUEST)
    }

    #[inline]
    pub fn time_tampered(&self) -> bool {
        self.control.has(ControlBits::TIME_TAMPER)
    }

    pub(crate) fn optional_fields(&self) -> OptionalFields {
        let mut fields = OptionalFields::default();
        fields.set(OptionalFields::IMPULSE, self.impulse.is_some());
        fields.set(OptionalFields::ACKED_CORRECTION, self.acked_correction.is_some());
        fields
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.delta_time.is_finite()
            && self.client_position.iter().all(|v| v.is_finite())
            && self.impulse.map_or(true, |i| i.iter().all(|v| v.is_finite()))
            && self.acked_correction.map_or(true, f64::is_finite)
    }
}

/// Authoritative state pushed to a client whose move was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Timestamp of the move being corrected.
    pub timestamp: f64,
    pub position: [f32; 3],
    pub rotation: [u16; 3],
    pub velocity: [f32; 3],
    pub mode: u8,
    /// Object the entity stands on, if any.
    pub base: Option<ObjectId>,
    /// Impulse the client must adopt instead of its own.
    pub impulse: Option<[f32; 3]>,
}

impl Correction {
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn rotation(&self) -> Quat {
        decompress_rotation(self.rotation)
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::from_array(self.velocity)
    }

    pub fn mode(&self) -> Option<MotionMode> {
        MotionMode::unpack(self.mode)
    }

    pub fn impulse_override(&self) -> Option<Vec3> {
        self.impulse.map(Vec3::from_array)
    }

    pub(crate) fn optional_fields(&self) -> OptionalFields {
        let mut fields = OptionalFields::default();
        fields.set(OptionalFields::BASE, self.base.is_some());
        fields.set(OptionalFields::IMPULSE_OVERRIDE, self.impulse.is_some());
        fields
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.impulse.map_or(true, |i| i.iter().all(|v| v.is_finite()))
    }
}

/// All moves a client sends in one packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveBatch {
    /// Oldest unacknowledged important move, resent in case it was lost.
    pub redundant: Option<WireMove>,
    /// New moves in timestamp order.
    pub moves: Vec<WireMove>,
}

impl MoveBatch {
    pub fn is_empty(&self) -> bool {
        self.redundant.is_none() && self.moves.is_empty()
    }

    /// Every move in processing order: the redundant copy first.
    pub fn iter(&self) -> impl Iterator<Item = &WireMove> {
        self.redundant.iter().chain(self.moves.iter())
    }
}

/// Server reply to a processed move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerPacket {
    /// Moves up to this timestamp were accepted.
    Ack { timestamp: f64 },
    Correction(Correction),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::{compress_rotation, compress_unit_vector};

    fn sample_move() -> WireMove {
        WireMove {
            timestamp: 1.5,
            delta_time: 1.0 / 60.0,
            acceleration: compress_unit_vector(Vec3::X),
            flags: MoveFlags::SPRINT | MoveFlags::WANTS_AUTHORITY,
            control: ControlBits(ControlBits::PRECISE_ROTATION),
            rotation: compress_rotation(Quat::IDENTITY),
            client_position: [1.0, 2.0, 3.0],
            client_mode: MotionMode::Grounded.pack(),
            impulse: None,
            acked_correction: None,
        }
    }

    #[test]
    fn test_authority_request_travels_in_control_bits() {
        let mut wire = sample_move();
        let input = wire.input();
        assert!(!input.flags.pressed(MoveFlags::WANTS_AUTHORITY), "flag byte alone does not grant a request");
        assert!(input.flags.pressed(MoveFlags::SPRINT));
        assert!(input.precise_rotation);

        wire.control.set(ControlBits::AUTHORITY_REQUEST, true);
        assert!(wire.input().flags.pressed(MoveFlags::WANTS_AUTHORITY));
    }

    #[test]
    fn test_optional_field_mask() {
        let mut wire = sample_move();
        assert_eq!(wire.optional_fields(), OptionalFields::default());

        wire.impulse = Some([0.0, 5.0, 0.0]);
        wire.acked_correction = Some(1.0);
        let fields = wire.optional_fields();
        assert!(fields.has(OptionalFields::IMPULSE));
        assert!(fields.has(OptionalFields::ACKED_CORRECTION));
        assert!(!fields.has(OptionalFields::BASE));
    }

    #[test]
    fn test_batch_iterates_redundant_first() {
        let mut older = sample_move();
        older.timestamp = 1.0;
        let batch = MoveBatch {
            redundant: Some(older),
            moves: vec![sample_move()],
        };

        let order: Vec<f64> = batch.iter().map(|m| m.timestamp).collect();
        assert_eq!(order, vec![1.0, 1.5]);
    }
}
