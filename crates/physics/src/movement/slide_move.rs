//! Slide move algorithm for collision response.
//!
//! This implements the classic Quake slide move on top of the multi-volume
//! sweep engine, so movement slides smoothly along walls and around corners
//! whichever volume made contact.

use glam::{Quat, Vec3};

use crate::collision::SweepContext;

use super::kernel::{StepAbort, Substep};
use super::state::MovementState;

/// Maximum number of collision planes to track during slide move.
const MAX_CLIP_PLANES: usize = 5;

/// Extra drop below the step height when stepping back down.
const STEP_DOWN_MARGIN: f32 = 0.01;

/// Clip velocity against a surface normal.
///
/// This removes the component of velocity going into the surface and
/// optionally adds a small "overbounce" to prevent sticking.
pub fn clip_velocity(velocity: Vec3, normal: Vec3, overbounce: f32) -> Vec3 {
    let backoff = velocity.dot(normal);

    let adjusted_backoff = if backoff < 0.0 {
        backoff * overbounce
    } else {
        backoff / overbounce
    };

    velocity - normal * adjusted_backoff
}

/// Slide the entity through the world for one substep.
///
/// Moves by `velocity + impulse`, applying `rotation_delta` on the first
/// sweep. Each blocking contact clips both velocity and impulse against the
/// contact plane; deferred contacts clip velocity only.
///
/// # Returns
///
/// Whether the full movement succeeded without any blocking contact.
pub fn slide_move(
    state: &mut MovementState,
    sub: &mut Substep<'_, '_>,
    rotation_delta: Quat,
) -> Result<bool, StepAbort> {
    let ctx = SweepContext {
        world: sub.env.world,
        base: state.mover_base(),
        riders: sub.env.riders,
    };
    slide_with_context(state, sub, &ctx, rotation_delta)
}

fn slide_with_context(
    state: &mut MovementState,
    sub: &mut Substep<'_, '_>,
    ctx: &SweepContext<'_>,
    rotation_delta: Quat,
) -> Result<bool, StepAbort> {
    let volumes = sub.env.volumes;
    let overbounce = sub.config.overbounce;
    let iterations = sub.config.max_clip_planes.clamp(1, MAX_CLIP_PLANES);

    let mut root = state.pose();
    let mut rotation = rotation_delta;
    let mut time_remaining = sub.dt;
    let original_velocity = state.velocity;
    let mut planes: [Vec3; MAX_CLIP_PLANES] = [Vec3::ZERO; MAX_CLIP_PLANES];
    let mut num_planes = 0;
    let mut clear = false;

    for _ in 0..iterations {
        let motion = state.velocity + state.impulse;
        if motion.length_squared() < 1e-8 && rotation == Quat::IDENTITY {
            clear = num_planes == 0;
            break;
        }

        let outcome = sub
            .env
            .sweeper
            .sweep_all(ctx, &mut root, volumes, motion * time_remaining, rotation);
        if !outcome.accepted {
            return Err(StepAbort::MissingPrimaryVolume);
        }
        rotation = Quat::IDENTITY;

        for contact in &outcome.deferred {
            if state.velocity.dot(contact.normal) < 0.0 {
                state.velocity = clip_velocity(state.velocity, contact.normal, overbounce);
            }
        }

        let Some(hit) = outcome.blocking else {
            clear = num_planes == 0;
            break;
        };

        time_remaining *= 1.0 - outcome.applied_fraction;

        // Stuck inside something the sweep could not resolve.
        if hit.started_penetrating {
            state.velocity = Vec3::ZERO;
            break;
        }

        if num_planes < MAX_CLIP_PLANES {
            planes[num_planes] = hit.normal;
            num_planes += 1;
        }

        if state.impulse.dot(hit.normal) < 0.0 {
            state.impulse = clip_velocity(state.impulse, hit.normal, 1.0);
        }

        // Try to clip velocity to slide along all encountered planes
        let mut found_valid = false;
        let mut clipped = state.velocity;
        for i in 0..num_planes {
            clipped = clip_velocity(clipped, planes[i], overbounce);

            let valid = (0..num_planes)
                .filter(|&j| j != i)
                .all(|j| clipped.dot(planes[j]) >= -0.01);

            if valid {
                state.velocity = clipped;
                found_valid = true;
                break;
            }
        }

        if !found_valid {
            if num_planes >= 2 {
                // Slide along the crease between the first two planes
                let crease = planes[0].cross(planes[1]).normalize_or_zero();
                state.velocity = crease * original_velocity.dot(crease);

                if state.velocity.dot(planes[0]) < -0.01 || state.velocity.dot(planes[1]) < -0.01 {
                    state.velocity = Vec3::ZERO;
                    break;
                }
            } else {
                state.velocity = Vec3::ZERO;
                break;
            }
        }
    }

    state.set_pose(root);
    Ok(clear)
}

/// Slide move with stair stepping for entities on the ground.
///
/// If the plain slide is blocked, retry from `step_height` higher and step
/// back down; keep whichever attempt got further horizontally and ended on
/// walkable ground.
pub fn step_slide_move(
    state: &mut MovementState,
    sub: &mut Substep<'_, '_>,
    rotation_delta: Quat,
) -> Result<bool, StepAbort> {
    let start = state.clone();

    if slide_move(state, sub, rotation_delta)? {
        return Ok(true);
    }

    let step_height = sub.config.step_height;
    if step_height <= 0.0 {
        return Ok(false);
    }

    let horizontal_dist_sq = horizontal_sq(state.position - start.position);

    // Stepping never ignores the floor, even a mover we ride on.
    let ctx = SweepContext {
        world: sub.env.world,
        base: None,
        riders: sub.env.riders,
    };
    let volumes = sub.env.volumes;

    let mut up_root = start.pose();
    let up = sub
        .env
        .sweeper
        .sweep_all(&ctx, &mut up_root, volumes, Vec3::Y * step_height, Quat::IDENTITY);
    if !up.accepted || up.blocking.is_some_and(|h| h.started_penetrating) {
        return Ok(false);
    }

    let mut stepped = start.clone();
    stepped.position = up_root.position;
    slide_move(&mut stepped, sub, rotation_delta)?;

    let drop = up_root.position.y - start.position.y + STEP_DOWN_MARGIN;
    let mut down_root = stepped.pose();
    let down = sub
        .env
        .sweeper
        .sweep_all(&ctx, &mut down_root, volumes, Vec3::NEG_Y * drop, Quat::IDENTITY);
    stepped.position = down_root.position;

    let landed = down
        .blocking
        .is_some_and(|h| !h.started_penetrating && h.normal.y >= sub.config.min_ground_normal);

    if landed && horizontal_sq(stepped.position - start.position) > horizontal_dist_sq + 1e-3 {
        log::trace!("stepped up {:.3}", stepped.position.y - start.position.y);
        *state = stepped;
        return Ok(true);
    }

    Ok(false)
}

fn horizontal_sq(v: Vec3) -> f32 {
    v.x * v.x + v.z * v.z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{CollisionVolumeSet, CollisionWorld, ContentFlags, SweepConfig, SweepEngine, TraceShape};
    use crate::movement::config::MovementConfig;
    use crate::movement::input::MoveInput;
    use crate::movement::kernel::StepEnv;
    use crate::movement::modifiers::NoModifiers;

    fn floor_world() -> CollisionWorld {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(0.0, -0.5, 0.0), Vec3::new(50.0, 0.5, 50.0), ContentFlags::SOLID);
        world
    }

    fn run_slide(world: &CollisionWorld, state: &mut MovementState, stepping: bool) -> bool {
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let mut sweeper = SweepEngine::new(SweepConfig::default());
        let mut env = StepEnv {
            world,
            volumes: &volumes,
            sweeper: &mut sweeper,
            modifiers: &NoModifiers,
            riders: &[],
        };
        let config = MovementConfig::default();
        let input = MoveInput::default();
        let mut sub = Substep {
            dt: 1.0,
            input: &input,
            config: &config,
            env: &mut env,
        };
        let result = if stepping {
            step_slide_move(state, &mut sub, Quat::IDENTITY)
        } else {
            slide_move(state, &mut sub, Quat::IDENTITY)
        };
        result.expect("primary volume present")
    }

    #[test]
    fn test_clip_velocity_wall() {
        // Moving into a wall on the +X side
        let velocity = Vec3::new(10.0, 0.0, 5.0);
        let wall_normal = Vec3::new(-1.0, 0.0, 0.0);

        let clipped = clip_velocity(velocity, wall_normal, 1.0);

        // X component should be zeroed, Z unchanged
        assert!(clipped.x.abs() < 0.01);
        assert!((clipped.z - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_slide_move_no_collision() {
        let world = CollisionWorld::new();
        let mut state = MovementState::new(Vec3::ZERO);
        state.velocity = Vec3::new(5.0, 0.0, 0.0);

        assert!(run_slide(&world, &mut state, false));
        assert!((state.position.x - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_slide_move_along_wall() {
        let mut world = floor_world();
        world.add_box(Vec3::new(5.5, 2.0, 0.0), Vec3::new(0.5, 2.0, 10.0), ContentFlags::SOLID);

        let mut state = MovementState::new(Vec3::new(0.0, 0.95, 0.0));
        state.velocity = Vec3::new(10.0, 0.0, 5.0);

        let clear = run_slide(&world, &mut state, false);

        assert!(!clear);
        assert!(state.position.x < 4.61, "x={} should stop at the wall", state.position.x);
        assert!(state.position.z > 2.0, "z={} should keep sliding", state.position.z);
        assert!(state.velocity.x.abs() < 0.1, "into-wall velocity removed");
    }

    #[test]
    fn test_step_slide_climbs_small_ledge() {
        let mut world = floor_world();
        // 0.3m ledge starting at x=2
        world.add_box(Vec3::new(7.0, 0.15, 0.0), Vec3::new(5.0, 0.15, 5.0), ContentFlags::SOLID);

        let mut state = MovementState::grounded(Vec3::new(0.0, 0.905, 0.0));
        state.velocity = Vec3::new(4.0, 0.0, 0.0);

        run_slide(&world, &mut state, true);

        assert!(state.position.x > 3.0, "x={} should pass the ledge edge", state.position.x);
        assert!(state.position.y > 1.15, "y={} should be on top of the ledge", state.position.y);
    }

    #[test]
    fn test_step_slide_blocked_by_tall_wall() {
        let mut world = floor_world();
        world.add_box(Vec3::new(7.0, 1.0, 0.0), Vec3::new(5.0, 1.0, 5.0), ContentFlags::SOLID);

        let mut state = MovementState::grounded(Vec3::new(0.0, 0.905, 0.0));
        state.velocity = Vec3::new(4.0, 0.0, 0.0);

        run_slide(&world, &mut state, true);

        assert!(state.position.x < 1.61, "x={}", state.position.x);
        assert!(state.position.y < 1.0);
    }
}
