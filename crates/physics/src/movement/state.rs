//! Movement state.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::collision::{ObjectId, Pose};

use super::modes::MotionMode;

/// Flags describing the entity's current movement state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFlags(pub u16);

impl MovementFlags {
    /// Entity is touching walkable ground.
    pub const ON_GROUND: u16 = 1 << 0;

    /// Entity left the ground via a jump and has not landed yet.
    pub const JUMPING: u16 = 1 << 1;

    /// Primary volume is inside a fluid.
    pub const IN_FLUID: u16 = 1 << 2;

    /// Check if a flag is set.
    #[inline]
    pub fn has(self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Set or clear a flag.
    #[inline]
    pub fn set(&mut self, flag: u16, value: bool) {
        if value {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    #[inline]
    pub fn on_ground(self) -> bool {
        self.has(Self::ON_GROUND)
    }

    #[inline]
    pub fn jumping(self) -> bool {
        self.has(Self::JUMPING)
    }
}

/// The surface the entity is standing on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundInfo {
    pub object: Option<ObjectId>,
    pub normal: Vec3,
    /// The ground is a mover the entity rides on.
    pub mover: bool,
}

/// Complete movement state for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementState {
    /// Root position in world space.
    pub position: Vec3,

    /// Root orientation (facing).
    pub rotation: Quat,

    /// Velocity from mode integration (meters/second).
    pub velocity: Vec3,

    /// Residual external impulse velocity. Moves the entity alongside
    /// `velocity` but decays on its own.
    pub impulse: Vec3,

    pub mode: MotionMode,

    pub flags: MovementFlags,

    pub ground: Option<GroundInfo>,

    /// Seconds until another jump is allowed.
    pub jump_cooldown: f32,
}

impl Default for MovementState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            impulse: Vec3::ZERO,
            mode: MotionMode::Falling,
            flags: MovementFlags::default(),
            ground: None,
            jump_cooldown: 0.0,
        }
    }
}

impl MovementState {
    /// Create a new movement state at the given position.
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Create a grounded state. The next ground check snaps it to the floor.
    pub fn grounded(position: Vec3) -> Self {
        Self {
            position,
            mode: MotionMode::Grounded,
            ..Default::default()
        }
    }

    #[inline]
    pub fn pose(&self) -> Pose {
        Pose::new(self.position, self.rotation)
    }

    #[inline]
    pub fn set_pose(&mut self, pose: Pose) {
        self.position = pose.position;
        self.rotation = pose.rotation;
    }

    /// Get current horizontal speed.
    pub fn horizontal_speed(&self) -> f32 {
        Vec3::new(self.velocity.x, 0.0, self.velocity.z).length()
    }

    /// Object the entity rides on, if it is a mover.
    pub fn mover_base(&self) -> Option<ObjectId> {
        self.ground.filter(|g| g.mover).and_then(|g| g.object)
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.rotation.is_finite()
            && self.velocity.is_finite()
            && self.impulse.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_flags() {
        let mut flags = MovementFlags::default();
        assert!(!flags.on_ground());

        flags.set(MovementFlags::ON_GROUND, true);
        assert!(flags.on_ground());

        flags.set(MovementFlags::ON_GROUND, false);
        assert!(!flags.on_ground());
    }

    #[test]
    fn test_mover_base_only_for_movers() {
        let mut state = MovementState::grounded(Vec3::ZERO);
        state.ground = Some(GroundInfo {
            object: Some(3),
            normal: Vec3::Y,
            mover: false,
        });
        assert_eq!(state.mover_base(), None);

        state.ground = Some(GroundInfo {
            object: Some(3),
            normal: Vec3::Y,
            mover: true,
        });
        assert_eq!(state.mover_base(), Some(3));
    }
}
