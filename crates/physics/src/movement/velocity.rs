//! Velocity, facing and impulse rules shared by every motion mode.

use glam::{Quat, Vec3};

use super::config::{ModeParams, MovementConfig};
use super::input::MoveFlags;
use super::modes::MotionMode;
use super::modifiers::{ModifierKey, MovementModifiers};

/// Below this speed braking stops the entity outright.
const BRAKE_STOP_SPEED: f32 = 1e-3;

/// Speed above the cap tolerated before braking kicks in.
const OVER_SPEED_TOLERANCE: f32 = 1.01;

/// Effective speed cap and acceleration for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimits {
    pub max_speed: f32,
    pub acceleration: f32,
}

/// Resolve the speed cap for a mode: forced speed beats the requested gait,
/// which beats the mode default. Multipliers apply last; results are >= 0.
pub fn resolve_limits(
    config: &MovementConfig,
    mode: MotionMode,
    flags: MoveFlags,
    modifiers: &dyn MovementModifiers,
) -> SpeedLimits {
    let params = config.mode_params(mode);

    let on_foot = matches!(mode, MotionMode::Grounded | MotionMode::Maneuvering);
    let requested = if !on_foot {
        None
    } else if flags.pressed(MoveFlags::LIMP) {
        Some(params.max_speed * config.limp_multiplier)
    } else if flags.pressed(MoveFlags::SPRINT) {
        Some(params.max_speed * config.sprint_multiplier)
    } else if flags.pressed(MoveFlags::TROT) {
        Some(params.max_speed * config.trot_multiplier)
    } else {
        None
    };

    let base = modifiers
        .scalar(ModifierKey::ForcedSpeed)
        .or(requested)
        .unwrap_or(params.max_speed);

    let speed_mult = modifiers.scalar(ModifierKey::MaxSpeedMultiplier).unwrap_or(1.0);
    let accel_mult = modifiers.scalar(ModifierKey::AccelerationMultiplier).unwrap_or(1.0);

    SpeedLimits {
        max_speed: (base * speed_mult).max(0.0),
        acceleration: (params.acceleration * accel_mult).max(0.0),
    }
}

/// Advance velocity toward the input for one step.
///
/// Brakes when there is no input, when already over the cap, or when the stop
/// flag is set. Otherwise steers the current velocity toward the input
/// direction with friction, accelerates, and clamps to the cap.
pub fn calc_velocity(
    velocity: Vec3,
    input: Vec3,
    limits: SpeedLimits,
    params: &ModeParams,
    stop: bool,
    dt: f32,
) -> Vec3 {
    let accel = input.clamp_length_max(1.0) * limits.acceleration;
    let speed = velocity.length();
    let over_cap = speed > limits.max_speed * OVER_SPEED_TOLERANCE;

    if stop || accel == Vec3::ZERO {
        return apply_braking(velocity, params.friction, params.braking_deceleration, dt);
    }

    if over_cap {
        // Keep braking; input may steer but never add speed.
        let braked = apply_braking(velocity, params.friction, params.braking_deceleration, dt);
        return (braked + accel * dt).clamp_length_max(braked.length());
    }

    let direction = accel.normalize();
    let steered = velocity - (velocity - direction * speed) * (dt * params.friction).min(1.0);

    (steered + accel * dt).clamp_length_max(limits.max_speed)
}

/// Decelerate by friction and a constant braking force.
///
/// Never reverses direction: a step that would cross zero stops instead.
pub fn apply_braking(velocity: Vec3, friction: f32, deceleration: f32, dt: f32) -> Vec3 {
    if velocity.length_squared() < BRAKE_STOP_SPEED * BRAKE_STOP_SPEED {
        return Vec3::ZERO;
    }
    if friction <= 0.0 && deceleration <= 0.0 {
        return velocity;
    }

    let reverse = -velocity.normalize() * deceleration;
    let next = velocity + (-friction * velocity + reverse) * dt;

    if next.dot(velocity) <= 0.0 || next.length_squared() < BRAKE_STOP_SPEED * BRAKE_STOP_SPEED {
        Vec3::ZERO
    } else {
        next
    }
}

/// Rotate toward `target` at no more than `turn_rate` radians per second.
pub fn rotate_toward(current: Quat, target: Quat, turn_rate: f32, dt: f32) -> Quat {
    if turn_rate <= 0.0 {
        return target.normalize();
    }

    let angle = current.angle_between(target);
    let max_step = turn_rate * dt;

    if angle <= max_step || angle < 1e-6 {
        target.normalize()
    } else {
        current.slerp(target, max_step / angle).normalize()
    }
}

/// Facing that looks along `direction`, with forward being +X.
///
/// Horizontal facing uses yaw only; `with_pitch` also tilts toward the
/// vertical component (swimming and flying).
pub fn facing_toward(direction: Vec3, with_pitch: bool) -> Option<Quat> {
    let horizontal = Vec3::new(direction.x, 0.0, direction.z);
    let horizontal_len = horizontal.length();

    if horizontal_len < 1e-6 && (!with_pitch || direction.y.abs() < 1e-6) {
        return None;
    }

    let yaw = if horizontal_len < 1e-6 {
        0.0
    } else {
        (-direction.z).atan2(direction.x)
    };

    if with_pitch {
        let pitch = direction.y.atan2(horizontal_len);
        Some(Quat::from_rotation_y(yaw) * Quat::from_rotation_z(pitch))
    } else {
        Some(Quat::from_rotation_y(yaw))
    }
}

/// Yaw-only part of a rotation, keeping forward on the horizontal plane.
pub fn yaw_only(rotation: Quat) -> Quat {
    let forward = rotation * Vec3::X;
    facing_toward(forward, false).unwrap_or(Quat::IDENTITY)
}

/// Decay an external impulse; slow residue is dropped.
pub fn decay_impulse(impulse: Vec3, friction: f32, min_speed: f32, dt: f32) -> Vec3 {
    let decayed = impulse * (1.0 - friction * dt).max(0.0);
    if decayed.length() < min_speed {
        Vec3::ZERO
    } else {
        decayed
    }
}
