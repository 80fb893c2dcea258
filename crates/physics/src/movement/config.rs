//! Movement configuration.
//!
//! All movement parameters are grouped here for easy tuning. Values are
//! configuration data consumed by the kernel; the presets are examples.

use serde::{Deserialize, Serialize};

use crate::collision::ContentFlags;

use super::modes::MotionMode;

/// Per-mode speed and acceleration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeParams {
    /// Default speed cap (meters/second).
    pub max_speed: f32,

    /// Acceleration at full input (meters/second²).
    pub acceleration: f32,

    /// Constant deceleration applied while braking (meters/second²).
    pub braking_deceleration: f32,

    /// Friction used both for steering and for braking.
    pub friction: f32,

    /// Facing turn rate (radians/second). Zero or less turns instantly.
    pub turn_rate: f32,
}

impl ModeParams {
    pub const fn new(max_speed: f32, acceleration: f32, braking_deceleration: f32, friction: f32, turn_rate: f32) -> Self {
        Self {
            max_speed,
            acceleration,
            braking_deceleration,
            friction,
            turn_rate,
        }
    }
}

/// Configuration for entity movement physics.
///
/// All values use metric units (meters, seconds) unless otherwise noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    // ========================================================================
    // Modes
    // ========================================================================
    pub grounded: ModeParams,
    pub falling: ModeParams,
    pub swimming: ModeParams,
    pub flying: ModeParams,
    pub maneuvering: ModeParams,
    pub incapacitated: ModeParams,

    // ========================================================================
    // Gaits (multipliers on the grounded speed cap)
    // ========================================================================
    pub sprint_multiplier: f32,
    pub trot_multiplier: f32,
    pub limp_multiplier: f32,

    // ========================================================================
    // Physics
    // ========================================================================
    /// Gravity acceleration (meters/second²).
    pub gravity: f32,

    /// Apex height of a standing jump (meters).
    pub jump_height: f32,

    /// Minimum time between jumps (seconds).
    pub jump_cooldown: f32,

    /// Air control factor (0.0 = no air control, 1.0 = full control).
    pub air_control: f32,

    /// Fraction of gravity cancelled in fluid (1.0 = neutral buoyancy).
    pub buoyancy: f32,

    /// Whether leaving fluid high above ground switches to flying.
    pub flight_allowed: bool,

    /// Clearance below the entity required to keep flying after leaving fluid.
    pub flight_clearance: f32,

    // ========================================================================
    // Ground
    // ========================================================================
    /// Minimum surface normal Y to be considered ground (cos of max slope angle).
    /// 0.7 ≈ 45 degrees
    pub min_ground_normal: f32,

    /// Maximum ledge height the entity steps up without jumping.
    pub step_height: f32,

    /// How far below the primary volume to look for ground.
    pub ground_probe_distance: f32,

    // ========================================================================
    // Integration
    // ========================================================================
    /// Longest single integration step (seconds).
    pub max_substep: f32,

    /// Upper bound on substeps per move; longer moves are truncated.
    pub max_substeps: u32,

    /// Decay rate of external impulses (1/seconds).
    pub impulse_friction: f32,

    /// Impulses slower than this are dropped (meters/second).
    pub impulse_min_speed: f32,

    // ========================================================================
    // Collision
    // ========================================================================
    /// Maximum collision iterations per slide.
    pub max_clip_planes: usize,

    /// Overbounce factor for velocity reflection (prevents sticking).
    pub overbounce: f32,

    /// Contents that block movement.
    pub collision_mask: ContentFlags,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self::humanoid()
    }
}

impl MovementConfig {
    /// A biped on foot.
    pub fn humanoid() -> Self {
        Self {
            grounded: ModeParams::new(4.5, 20.0, 20.0, 8.0, 10.0),
            falling: ModeParams::new(4.5, 20.0, 0.0, 0.0, 4.0),
            swimming: ModeParams::new(3.0, 10.0, 10.0, 2.0, 4.0),
            flying: ModeParams::new(6.0, 12.0, 8.0, 1.0, 4.0),
            maneuvering: ModeParams::new(2.5, 15.0, 25.0, 10.0, 0.0),
            incapacitated: ModeParams::new(0.0, 0.0, 15.0, 6.0, 0.0),

            sprint_multiplier: 1.6,
            trot_multiplier: 1.25,
            limp_multiplier: 0.5,

            gravity: 9.8,
            jump_height: 1.0,
            jump_cooldown: 0.2,
            air_control: 0.2,
            buoyancy: 1.0,
            flight_allowed: false,
            flight_clearance: 3.0,

            min_ground_normal: 0.7,
            step_height: 0.4,
            ground_probe_distance: 0.05,

            max_substep: 1.0 / 30.0,
            max_substeps: 8,
            impulse_friction: 4.0,
            impulse_min_speed: 0.05,

            max_clip_planes: 5,
            overbounce: 1.001,
            collision_mask: ContentFlags::MASK_MOVEMENT,
        }
    }

    /// A four-legged mount: faster, slower to turn, taller steps.
    pub fn quadruped() -> Self {
        Self {
            grounded: ModeParams::new(7.0, 12.0, 14.0, 6.0, 3.0),
            maneuvering: ModeParams::new(3.0, 10.0, 20.0, 8.0, 0.0),
            sprint_multiplier: 1.8,
            trot_multiplier: 1.35,
            step_height: 0.55,
            jump_height: 1.3,
            air_control: 0.1,
            ..Self::humanoid()
        }
    }

    /// A winged creature that keeps flying when it leaves water high up.
    pub fn flyer() -> Self {
        Self {
            flying: ModeParams::new(9.0, 15.0, 6.0, 0.5, 2.5),
            flight_allowed: true,
            ..Self::humanoid()
        }
    }

    /// Parameters for a motion mode. Root-motion steps use the grounded set
    /// for the facing turn rate only.
    pub fn mode_params(&self, mode: MotionMode) -> &ModeParams {
        match mode {
            MotionMode::Grounded | MotionMode::RootMotion => &self.grounded,
            MotionMode::Falling => &self.falling,
            MotionMode::Swimming => &self.swimming,
            MotionMode::Flying => &self.flying,
            MotionMode::Maneuvering => &self.maneuvering,
            MotionMode::Incapacitated => &self.incapacitated,
        }
    }

    /// Initial vertical speed needed to reach `jump_height` scaled by `multiplier`.
    pub fn jump_velocity(&self, multiplier: f32) -> f32 {
        (2.0 * self.gravity * self.jump_height * multiplier.max(0.0)).sqrt()
    }
}
