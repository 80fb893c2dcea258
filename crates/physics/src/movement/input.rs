//! Per-tick movement input.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Auxiliary movement request flags carried with every move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoveFlags(pub u8);

impl MoveFlags {
    /// Run at sprint speed.
    pub const SPRINT: u8 = 1 << 0;

    /// Intermediate gait between walk and sprint.
    pub const TROT: u8 = 1 << 1;

    /// Injured gait. Overrides sprint and trot.
    pub const LIMP: u8 = 1 << 2;

    /// Brake to a halt regardless of input.
    pub const STOP: u8 = 1 << 3;

    /// Enter the maneuvering mode when on firm ground.
    pub const MANEUVER: u8 = 1 << 4;

    /// Jump this tick.
    pub const JUMP: u8 = 1 << 5;

    /// Ask the server to trust the client's position while moving fast in
    /// an empty area.
    pub const WANTS_AUTHORITY: u8 = 1 << 6;

    /// The move's starting impulse includes a force the client applied
    /// itself and asks the server to adopt.
    pub const EXTERNAL_FORCE: u8 = 1 << 7;

    /// Check if a flag is set.
    #[inline]
    pub fn pressed(self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    /// Set a flag.
    #[inline]
    pub fn press(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Clear a flag.
    #[inline]
    pub fn release(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    #[inline]
    pub fn with(mut self, flag: u8) -> Self {
        self.press(flag);
        self
    }
}

/// Input for a single simulation tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveInput {
    /// Movement intent in world space, length at most 1.
    pub acceleration: Vec3,

    /// Where the controlling player is looking.
    pub control_rotation: Quat,

    pub flags: MoveFlags,

    /// Face the control rotation exactly instead of turning toward it.
    pub precise_rotation: bool,
}

impl Default for MoveInput {
    fn default() -> Self {
        Self {
            acceleration: Vec3::ZERO,
            control_rotation: Quat::IDENTITY,
            flags: MoveFlags::default(),
            precise_rotation: false,
        }
    }
}

impl MoveInput {
    /// Create an input, clamping the intent vector to unit length.
    pub fn new(acceleration: Vec3, control_rotation: Quat, flags: MoveFlags) -> Self {
        Self {
            acceleration: acceleration.clamp_length_max(1.0),
            control_rotation,
            flags,
            precise_rotation: false,
        }
    }

    /// Input pushing in a direction with the control rotation facing it.
    pub fn toward(direction: Vec3) -> Self {
        Self::new(direction, Quat::IDENTITY, MoveFlags::default())
    }

    #[inline]
    pub fn has_acceleration(&self) -> bool {
        self.acceleration.length_squared() > 1e-8
    }

    pub fn is_finite(&self) -> bool {
        self.acceleration.is_finite() && self.control_rotation.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_flags() {
        let mut flags = MoveFlags::default();
        assert!(!flags.pressed(MoveFlags::JUMP));

        flags.press(MoveFlags::JUMP);
        assert!(flags.pressed(MoveFlags::JUMP));

        flags.release(MoveFlags::JUMP);
        assert_eq!(flags, MoveFlags::default());
    }

    #[test]
    fn test_input_clamps_intent() {
        let input = MoveInput::toward(Vec3::new(3.0, 0.0, 4.0));
        assert!((input.acceleration.length() - 1.0).abs() < 1e-6);
        assert!(input.has_acceleration());
    }
}
