//! Motion modes and their integrators.
//!
//! Every mode is advanced by one function with the same signature, looked up
//! through [`MotionMode::integrator`]. The kernel picks the mode; the
//! integrator only moves the entity.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use super::input::MoveFlags;
use super::kernel::{StepAbort, Substep};
use super::modifiers::ModifierKey;
use super::slide_move::{clip_velocity, slide_move, step_slide_move};
use super::state::{MovementFlags, MovementState};
use super::velocity::{
    calc_velocity, decay_impulse, facing_toward, resolve_limits, rotate_toward, yaw_only,
};

/// Integrates one substep of a motion mode.
pub type Integrator = fn(&mut MovementState, &mut Substep<'_, '_>) -> Result<(), StepAbort>;

/// High-level locomotion state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionMode {
    Grounded = 0,
    #[default]
    Falling = 1,
    Swimming = 2,
    Flying = 3,
    Maneuvering = 4,
    Incapacitated = 5,
    /// Motion supplied by an animation or scripted path.
    RootMotion = 6,
}

impl MotionMode {
    pub const ALL: [MotionMode; 7] = [
        MotionMode::Grounded,
        MotionMode::Falling,
        MotionMode::Swimming,
        MotionMode::Flying,
        MotionMode::Maneuvering,
        MotionMode::Incapacitated,
        MotionMode::RootMotion,
    ];

    /// Wire representation.
    #[inline]
    pub fn pack(self) -> u8 {
        self as u8
    }

    pub fn unpack(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Modes that walk on and snap to the ground.
    #[inline]
    pub fn on_foot(self) -> bool {
        matches!(self, MotionMode::Grounded | MotionMode::Maneuvering)
    }

    pub fn integrator(self) -> Integrator {
        match self {
            MotionMode::Grounded => step_grounded,
            MotionMode::Falling => step_falling,
            MotionMode::Swimming => step_swimming,
            MotionMode::Flying => step_flying,
            MotionMode::Maneuvering => step_maneuvering,
            MotionMode::Incapacitated => step_incapacitated,
            MotionMode::RootMotion => step_root_motion,
        }
    }
}

/// Run one mode's integrator on a copy of `state`.
pub fn integrate(
    mode: MotionMode,
    state: &MovementState,
    sub: &mut Substep<'_, '_>,
) -> Result<MovementState, StepAbort> {
    let mut next = state.clone();
    next.mode = mode;
    (mode.integrator())(&mut next, sub)?;
    Ok(next)
}

// ============================================================================
// Integrators
// ============================================================================

fn step_grounded(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    if sub.input.flags.pressed(MoveFlags::JUMP) && state.jump_cooldown <= 0.0 && state.flags.on_ground() {
        let multiplier = sub
            .env
            .modifiers
            .scalar(ModifierKey::JumpHeightMultiplier)
            .unwrap_or(1.0);
        state.velocity.y = sub.config.jump_velocity(multiplier);
        state.mode = MotionMode::Falling;
        state.ground = None;
        state.flags.set(MovementFlags::ON_GROUND, false);
        state.flags.set(MovementFlags::JUMPING, true);
        state.jump_cooldown = sub.config.jump_cooldown;
        log::debug!("jump at {:?} vy={:.2}", state.position, state.velocity.y);
        return step_falling(state, sub);
    }

    walk(state, sub, false)
}

fn step_maneuvering(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    walk(state, sub, true)
}

fn step_falling(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    let params = *sub.config.mode_params(state.mode);
    let limits = resolve_limits(sub.config, state.mode, sub.input.flags, sub.env.modifiers);

    let input = horizontal(sub.input.acceleration) * sub.config.air_control;
    let planar = calc_velocity(horizontal(state.velocity), input, limits, &params, false, sub.dt);
    let vertical = state.velocity.y - sub.config.gravity * sub.dt;
    state.velocity = Vec3::new(planar.x, vertical, planar.z);

    let facing = desired_facing(state, sub, params.turn_rate, false, false);
    let rotation_delta = facing * state.rotation.inverse();

    slide_move(state, sub, rotation_delta)?;
    finish_impulse(state, sub);
    Ok(())
}

fn step_swimming(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    let sink = sub.config.gravity * (1.0 - sub.config.buoyancy);
    volumetric(state, sub, sink)
}

fn step_flying(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    volumetric(state, sub, 0.0)
}

fn step_incapacitated(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    let params = *sub.config.mode_params(state.mode);
    let limits = resolve_limits(sub.config, state.mode, MoveFlags::default(), sub.env.modifiers);

    let planar = calc_velocity(horizontal(state.velocity), Vec3::ZERO, limits, &params, true, sub.dt);
    let vertical = if state.flags.on_ground() {
        0.0
    } else {
        state.velocity.y - sub.config.gravity * sub.dt
    };
    state.velocity = Vec3::new(planar.x, vertical, planar.z);

    let rotation_delta = match sub.env.modifiers.forced_rotation() {
        Some(forced) => forced * state.rotation.inverse(),
        None => Quat::IDENTITY,
    };

    slide_move(state, sub, rotation_delta)?;
    finish_impulse(state, sub);
    Ok(())
}

fn step_root_motion(state: &mut MovementState, sub: &mut Substep<'_, '_>) -> Result<(), StepAbort> {
    let (translation, rotation) = match sub.env.modifiers.root_motion(sub.dt) {
        Some(step) => (step.translation, step.rotation),
        None => (Vec3::ZERO, Quat::IDENTITY),
    };

    state.velocity = if sub.dt > 0.0 {
        translation / sub.dt
    } else {
        Vec3::ZERO
    };

    slide_move(state, sub, rotation)?;
    finish_impulse(state, sub);
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Ground locomotion for the grounded and maneuvering modes.
fn walk(state: &mut MovementState, sub: &mut Substep<'_, '_>, lock_to_control: bool) -> Result<(), StepAbort> {
    let params = *sub.config.mode_params(state.mode);
    let limits = resolve_limits(sub.config, state.mode, sub.input.flags, sub.env.modifiers);
    let stop = sub.input.flags.pressed(MoveFlags::STOP);

    let input = horizontal(sub.input.acceleration);
    let mut velocity = calc_velocity(horizontal(state.velocity), input, limits, &params, stop, sub.dt);

    // Follow the slope we stand on
    if let Some(ground) = state.ground {
        velocity = clip_velocity(velocity, ground.normal, sub.config.overbounce);
    }
    state.velocity = velocity;

    let facing = desired_facing(state, sub, params.turn_rate, lock_to_control, false);
    let rotation_delta = facing * state.rotation.inverse();

    step_slide_move(state, sub, rotation_delta)?;

    // Ground velocity stays planar; the ground check handles height.
    state.velocity = horizontal(state.velocity);
    finish_impulse(state, sub);
    Ok(())
}

/// Free 3D movement for swimming and flying.
fn volumetric(state: &mut MovementState, sub: &mut Substep<'_, '_>, sink: f32) -> Result<(), StepAbort> {
    let params = *sub.config.mode_params(state.mode);
    let limits = resolve_limits(sub.config, state.mode, sub.input.flags, sub.env.modifiers);
    let stop = sub.input.flags.pressed(MoveFlags::STOP);

    let mut velocity = calc_velocity(state.velocity, sub.input.acceleration, limits, &params, stop, sub.dt);
    velocity.y -= sink * sub.dt;
    state.velocity = velocity;

    let facing = desired_facing(state, sub, params.turn_rate, false, true);
    let rotation_delta = facing * state.rotation.inverse();

    slide_move(state, sub, rotation_delta)?;
    finish_impulse(state, sub);
    Ok(())
}

/// Facing after this substep. Forced rotation wins; otherwise face the
/// control rotation (maneuvering or precise rotation) or the input direction.
fn desired_facing(
    state: &MovementState,
    sub: &Substep<'_, '_>,
    turn_rate: f32,
    lock_to_control: bool,
    with_pitch: bool,
) -> Quat {
    if let Some(forced) = sub.env.modifiers.forced_rotation() {
        return forced.normalize();
    }

    let control = if with_pitch {
        sub.input.control_rotation
    } else {
        yaw_only(sub.input.control_rotation)
    };

    if sub.input.precise_rotation {
        return control.normalize();
    }

    let target = if lock_to_control {
        control
    } else {
        facing_toward(sub.input.acceleration, with_pitch).unwrap_or(state.rotation)
    };

    rotate_toward(state.rotation, target, turn_rate, sub.dt)
}

fn finish_impulse(state: &mut MovementState, sub: &Substep<'_, '_>) {
    state.impulse = decay_impulse(
        state.impulse,
        sub.config.impulse_friction,
        sub.config.impulse_min_speed,
        sub.dt,
    );
}

#[inline]
fn horizontal(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}
