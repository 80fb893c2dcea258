//! Saved client moves.
//!
//! A [`MoveRecord`] is everything needed to send a move to the server and to
//! replay it locally after a correction.

use glam::Vec3;

use stride_physics::movement::{MoveFlags, MoveInput, MovementState};
use stride_protocol::{compress_rotation, compress_unit_vector, ControlBits, WireMove};

use super::buffer::BufferConfig;

/// One predicted client step.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRecord {
    /// Client time at the end of the move.
    pub timestamp: f64,
    pub delta_time: f32,
    /// Input as quantized for the wire.
    pub input: MoveInput,
    /// External impulse in effect when the move started.
    pub start_impulse: Vec3,
    /// State the client reached.
    pub result: MovementState,
    /// Already handed to the transport at least once.
    pub sent: bool,
}

/// Capture one simulated step.
pub fn record_move(
    timestamp: f64,
    input: MoveInput,
    delta_time: f32,
    start_impulse: Vec3,
    result: MovementState,
) -> MoveRecord {
    MoveRecord {
        timestamp,
        delta_time,
        input,
        start_impulse,
        result,
        sent: false,
    }
}

impl MoveRecord {
    #[inline]
    pub fn flags(&self) -> MoveFlags {
        self.input.flags
    }

    /// Build the wire form of this move.
    pub fn to_wire(&self, acked_correction: Option<f64>, time_tampered: bool) -> WireMove {
        let mut control = ControlBits::default();
        control.set(
            ControlBits::AUTHORITY_REQUEST,
            self.input.flags.pressed(MoveFlags::WANTS_AUTHORITY),
        );
        control.set(ControlBits::PRECISE_ROTATION, self.input.precise_rotation);
        control.set(ControlBits::TIME_TAMPER, time_tampered);

        WireMove {
            timestamp: self.timestamp,
            delta_time: self.delta_time,
            acceleration: compress_unit_vector(self.input.acceleration),
            flags: self.input.flags.0 & !MoveFlags::WANTS_AUTHORITY,
            control,
            rotation: compress_rotation(self.input.control_rotation),
            client_position: self.result.position.to_array(),
            client_mode: self.result.mode.pack(),
            impulse: (self.start_impulse != Vec3::ZERO).then(|| self.start_impulse.to_array()),
            acked_correction,
        }
    }
}

/// Merge `next` into `prev` when the pair replays as one longer move.
///
/// Both moves must carry the same input and neither may start under an
/// external impulse. `next` must end where `prev` would have ended by
/// continuing at its own velocity. Stop and jump moves are never merged.
pub fn try_combine(prev: &mut MoveRecord, next: &MoveRecord, config: &BufferConfig) -> bool {
    if prev.sent || next.sent {
        return false;
    }

    let edge_flags = MoveFlags::STOP | MoveFlags::JUMP;
    if prev.flags().0 & edge_flags != 0 || next.flags().0 & edge_flags != 0 {
        return false;
    }

    if prev.input != next.input || prev.result.mode != next.result.mode {
        return false;
    }

    if prev.start_impulse != Vec3::ZERO || next.start_impulse != Vec3::ZERO {
        return false;
    }

    let combined_dt = prev.delta_time + next.delta_time;
    if combined_dt > config.max_combined_dt {
        return false;
    }

    let velocity_error = (next.result.velocity - prev.result.velocity).length();
    if velocity_error > config.combine_velocity_tolerance {
        return false;
    }

    let extrapolated = prev.result.position + prev.result.velocity * next.delta_time;
    if (next.result.position - extrapolated).length() > config.combine_position_tolerance {
        return false;
    }

    log::trace!(
        "combined move {:.4} into {:.4} (dt {:.4})",
        next.timestamp,
        prev.timestamp,
        combined_dt
    );

    prev.timestamp = next.timestamp;
    prev.delta_time = combined_dt;
    prev.result = next.result.clone();
    true
}

/// Whether losing `candidate` would change how the server sees the client.
///
/// True when any flag or the mode differs from the last acknowledged move,
/// or the starting impulse differs by more than the configured magnitude or
/// angle. With nothing acknowledged yet every move is important.
pub fn is_important(candidate: &MoveRecord, last_acked: Option<&MoveRecord>, config: &BufferConfig) -> bool {
    let Some(acked) = last_acked else {
        return true;
    };

    if candidate.flags() != acked.flags() || candidate.result.mode != acked.result.mode {
        return true;
    }

    let a = candidate.start_impulse;
    let b = acked.start_impulse;
    if (a.length() - b.length()).abs() > config.important_impulse_magnitude {
        return true;
    }

    a != Vec3::ZERO && b != Vec3::ZERO && a.angle_between(b) > config.important_impulse_angle
}
