//! Read-only view of gameplay effects that influence movement.
//!
//! Abilities, status effects and animation systems live outside this crate.
//! The kernel only sees them through [`MovementModifiers`].

use std::collections::HashMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Stable keys for scalar movement modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifierKey {
    /// Multiplies the resolved speed cap.
    MaxSpeedMultiplier,
    /// Multiplies the resolved acceleration.
    AccelerationMultiplier,
    /// Replaces the speed cap outright.
    ForcedSpeed,
    /// Multiplies jump apex height.
    JumpHeightMultiplier,
}

/// Motion supplied by an animation or scripted path for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootMotionStep {
    pub translation: Vec3,
    pub rotation: Quat,
}

/// Queries the movement kernel makes against the effect system.
pub trait MovementModifiers {
    /// Scalar modifier value, if any effect provides one.
    fn scalar(&self, key: ModifierKey) -> Option<f32>;

    /// Rotation the entity must face, overriding all other facing rules.
    fn forced_rotation(&self) -> Option<Quat> {
        None
    }

    /// Entity is stunned, knocked down or otherwise unable to act.
    fn incapacitated(&self) -> bool {
        false
    }

    /// Effects allow entering the maneuvering mode.
    fn maneuver_allowed(&self) -> bool {
        true
    }

    /// Entity cannot move at all (e.g. dead). Aborts the step.
    fn movement_blocked(&self) -> bool {
        false
    }

    /// Externally driven motion for the next `dt` seconds.
    fn root_motion(&self, _dt: f32) -> Option<RootMotionStep> {
        None
    }

    /// An effect is pushing the entity along a path the server cannot
    /// reproduce exactly; the client's position should be trusted.
    fn has_forced_movement(&self) -> bool {
        false
    }
}

/// No active effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModifiers;

impl MovementModifiers for NoModifiers {
    fn scalar(&self, _key: ModifierKey) -> Option<f32> {
        None
    }
}

/// A plain table of modifier values, filled in by the owner each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifierTable {
    pub scalars: HashMap<ModifierKey, f32>,
    pub forced_rotation: Option<Quat>,
    pub incapacitated: bool,
    pub maneuver_blocked: bool,
    pub movement_blocked: bool,
    /// Root-motion velocity and turn rate (radians/second about Y).
    pub root_motion: Option<(Vec3, f32)>,
    pub forced_movement: bool,
}

impl ModifierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scalar(mut self, key: ModifierKey, value: f32) -> Self {
        self.scalars.insert(key, value);
        self
    }
}

impl MovementModifiers for ModifierTable {
    fn scalar(&self, key: ModifierKey) -> Option<f32> {
        self.scalars.get(&key).copied()
    }

    fn forced_rotation(&self) -> Option<Quat> {
        self.forced_rotation
    }

    fn incapacitated(&self) -> bool {
        self.incapacitated
    }

    fn maneuver_allowed(&self) -> bool {
        !self.maneuver_blocked
    }

    fn movement_blocked(&self) -> bool {
        self.movement_blocked
    }

    fn root_motion(&self, dt: f32) -> Option<RootMotionStep> {
        self.root_motion.map(|(velocity, yaw_rate)| RootMotionStep {
            translation: velocity * dt,
            rotation: Quat::from_rotation_y(yaw_rate * dt),
        })
    }

    fn has_forced_movement(&self) -> bool {
        self.forced_movement || self.root_motion.is_some()
    }
}
