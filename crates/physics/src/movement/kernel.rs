//! Movement simulation kernel.
//!
//! This is the main entry point for entity movement. Given a state, an input
//! and an elapsed time, it picks the motion mode, runs the mode's integrator
//! through the sweep engine in bounded substeps, and tracks the ground.
//!
//! The kernel never mutates its input state: a step either returns a complete
//! new state or aborts with nothing committed.

use glam::Vec3;
use thiserror::Error;

use crate::collision::{CollisionVolumeSet, CollisionWorld, ContentFlags, ObjectId, SweepEngine};

use super::config::MovementConfig;
use super::input::{MoveFlags, MoveInput};
use super::modes::MotionMode;
use super::modifiers::MovementModifiers;
use super::state::{GroundInfo, MovementFlags, MovementState};

/// Vertical speed above which the entity is considered to be leaving the ground.
const ASCEND_SPEED: f32 = 0.1;

/// Why a step produced no new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StepAbort {
    #[error("movement is blocked for this entity")]
    MovementBlocked,
    #[error("entity has no primary collision volume")]
    MissingPrimaryVolume,
    #[error("non-finite movement input or state")]
    NonFiniteInput,
}

/// Everything outside the entity's own state that a step reads or uses.
pub struct StepEnv<'a> {
    pub world: &'a CollisionWorld,
    pub volumes: &'a CollisionVolumeSet,
    pub sweeper: &'a mut SweepEngine,
    pub modifiers: &'a dyn MovementModifiers,
    /// Objects standing on this entity.
    pub riders: &'a [ObjectId],
}

impl<'a> StepEnv<'a> {
    pub fn new(
        world: &'a CollisionWorld,
        volumes: &'a CollisionVolumeSet,
        sweeper: &'a mut SweepEngine,
        modifiers: &'a dyn MovementModifiers,
    ) -> Self {
        Self {
            world,
            volumes,
            sweeper,
            modifiers,
            riders: &[],
        }
    }
}

/// One integration substep handed to a mode integrator.
pub struct Substep<'s, 'a> {
    pub dt: f32,
    pub input: &'s MoveInput,
    pub config: &'s MovementConfig,
    pub env: &'s mut StepEnv<'a>,
}

/// Entity movement kernel.
///
/// # Example
///
/// ```ignore
/// let kernel = MovementKernel::new(MovementConfig::default());
/// let mut env = StepEnv::new(&world, &volumes, &mut sweeper, &NoModifiers);
///
/// // Each tick:
/// state = kernel.step(&state, &input, delta_time, &mut env)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MovementKernel {
    pub config: MovementConfig,
}

impl MovementKernel {
    pub fn new(config: MovementConfig) -> Self {
        Self { config }
    }

    /// Split `dt` into equal substeps no longer than `max_substep`.
    ///
    /// Returns the substep count and length. Time beyond
    /// `max_substep * max_substeps` is dropped.
    pub fn substeps(&self, dt: f32) -> (u32, f32) {
        let max_substep = self.config.max_substep.max(1e-4);
        let max_substeps = self.config.max_substeps.max(1);

        let total = dt.min(max_substep * max_substeps as f32);
        // Tolerance keeps an exact multiple of the substep from rounding up.
        let count = ((total / max_substep) - 1e-3).ceil().clamp(1.0, max_substeps as f32) as u32;

        (count, total / count as f32)
    }

    /// Advance `state` by `dt` seconds of `input`.
    pub fn step(
        &self,
        state: &MovementState,
        input: &MoveInput,
        dt: f32,
        env: &mut StepEnv<'_>,
    ) -> Result<MovementState, StepAbort> {
        if !dt.is_finite() || dt < 0.0 || !input.is_finite() || !state.is_finite() {
            return Err(StepAbort::NonFiniteInput);
        }

        if env.volumes.primary().is_none() {
            log::warn!("movement step skipped: entity has no primary collision volume");
            return Err(StepAbort::MissingPrimaryVolume);
        }

        let mut next = state.clone();
        if dt == 0.0 {
            return Ok(next);
        }

        let (count, sub_dt) = self.substeps(dt);
        for _ in 0..count {
            if env.modifiers.movement_blocked() {
                return Err(StepAbort::MovementBlocked);
            }

            self.resolve_mode(&mut next, input, sub_dt, env);

            let mut sub = Substep {
                dt: sub_dt,
                input,
                config: &self.config,
                env: &mut *env,
            };
            (next.mode.integrator())(&mut next, &mut sub)?;

            self.update_ground(&mut next, env);
            next.jump_cooldown = (next.jump_cooldown - sub_dt).max(0.0);
        }

        if !next.is_finite() {
            return Err(StepAbort::NonFiniteInput);
        }

        Ok(next)
    }

    /// Place a new entity on the ground below `position`.
    pub fn spawn_at(&self, position: Vec3, env: &StepEnv<'_>) -> MovementState {
        let mut state = MovementState::new(position);
        self.update_ground(&mut state, env);
        if state.ground.is_some() {
            state.mode = MotionMode::Grounded;
        }
        state
    }

    // ========================================================================
    // Mode Selection
    // ========================================================================

    /// Pick the mode for the next substep.
    ///
    /// Root motion beats incapacity, which beats fluid; otherwise the current
    /// mode's own exit rules apply.
    fn resolve_mode(&self, state: &mut MovementState, input: &MoveInput, dt: f32, env: &StepEnv<'_>) {
        let previous = state.mode;
        let in_fluid = self.in_fluid(state, env);
        state.flags.set(MovementFlags::IN_FLUID, in_fluid);

        let next = if env.modifiers.root_motion(dt).is_some() {
            MotionMode::RootMotion
        } else if env.modifiers.incapacitated() {
            MotionMode::Incapacitated
        } else if in_fluid {
            MotionMode::Swimming
        } else {
            match previous {
                MotionMode::Swimming => {
                    if state.ground.is_some() {
                        MotionMode::Grounded
                    } else if self.config.flight_allowed
                        && self.clearance_below(state, env, self.config.flight_clearance)
                    {
                        MotionMode::Flying
                    } else {
                        MotionMode::Falling
                    }
                }
                MotionMode::Flying if !self.config.flight_allowed => MotionMode::Falling,
                MotionMode::RootMotion | MotionMode::Incapacitated => {
                    if state.ground.is_some() {
                        MotionMode::Grounded
                    } else {
                        MotionMode::Falling
                    }
                }
                MotionMode::Grounded | MotionMode::Maneuvering => {
                    if self.wants_maneuver(state, input, env) {
                        MotionMode::Maneuvering
                    } else {
                        MotionMode::Grounded
                    }
                }
                other => other,
            }
        };

        if next != previous {
            log::debug!("motion mode {:?} -> {:?}", previous, next);
            state.mode = next;
        }
    }

    fn wants_maneuver(&self, state: &MovementState, input: &MoveInput, env: &StepEnv<'_>) -> bool {
        input.flags.pressed(MoveFlags::MANEUVER)
            && env.modifiers.maneuver_allowed()
            && state
                .ground
                .is_some_and(|g| g.normal.y >= self.config.min_ground_normal)
    }

    fn in_fluid(&self, state: &MovementState, env: &StepEnv<'_>) -> bool {
        env.volumes
            .world_pose(&state.pose(), 0)
            .is_some_and(|pose| env.world.contents_at(pose.position).intersects(ContentFlags::MASK_FLUID))
    }

    /// Whether nothing blocks the primary volume within `distance` below it.
    fn clearance_below(&self, state: &MovementState, env: &StepEnv<'_>, distance: f32) -> bool {
        let Some(primary) = env.volumes.primary() else {
            return false;
        };
        let start = state.pose().compose(&primary.offset);
        let end = start.translated(Vec3::NEG_Y * distance);
        !env.world
            .trace(&start, &end, primary.shape, self.config.collision_mask)
            .hit_something()
    }

    // ========================================================================
    // Ground Detection
    // ========================================================================

    /// Recompute ground contact in place without moving the entity.
    ///
    /// Used after a state is overwritten from outside (e.g. a server
    /// correction) so the next step starts with fresh ground info.
    pub fn refresh_ground(&self, state: &mut MovementState, env: &StepEnv<'_>) {
        match self.probe_ground(state, env) {
            Some((ground, _)) => {
                state.ground = Some(ground);
                state.flags.set(MovementFlags::ON_GROUND, true);
            }
            None => {
                state.ground = None;
                state.flags.set(MovementFlags::ON_GROUND, false);
            }
        }
    }

    /// Walkable ground below the primary volume and the offset that snaps onto it.
    fn probe_ground(&self, state: &MovementState, env: &StepEnv<'_>) -> Option<(GroundInfo, Vec3)> {
        let primary = env.volumes.primary()?;

        let start = state.pose().compose(&primary.offset);
        let end = start.translated(Vec3::NEG_Y * self.config.ground_probe_distance);
        let trace = env.world.trace(&start, &end, primary.shape, self.config.collision_mask);

        let normal = trace
            .hit_normal
            .filter(|n| trace.hit_something() && n.y >= self.config.min_ground_normal)?;

        let snap = if trace.started_in_solid {
            Vec3::ZERO
        } else {
            trace.end_pose.position - start.position
        };

        let ground = GroundInfo {
            object: trace.hit_object,
            normal,
            mover: trace.hit_contents.contains(ContentFlags::MOVER),
        };
        Some((ground, snap))
    }

    fn update_ground(&self, state: &mut MovementState, env: &StepEnv<'_>) {
        if env.volumes.primary().is_none() {
            return;
        }

        if state.velocity.y + state.impulse.y > ASCEND_SPEED {
            self.leave_ground(state);
            return;
        }

        let Some((ground, snap)) = self.probe_ground(state, env) else {
            self.leave_ground(state);
            return;
        };

        state.ground = Some(ground);
        state.flags.set(MovementFlags::ON_GROUND, true);

        let snaps = matches!(
            state.mode,
            MotionMode::Grounded | MotionMode::Maneuvering | MotionMode::Falling | MotionMode::Incapacitated
        );
        if !snaps {
            return;
        }

        state.position += snap;
        state.velocity.y = 0.0;
        state.flags.set(MovementFlags::JUMPING, false);

        if state.mode == MotionMode::Falling {
            log::debug!("landed at {:?}", state.position);
            state.mode = MotionMode::Grounded;
        }
    }

    fn leave_ground(&self, state: &mut MovementState) {
        state.ground = None;
        state.flags.set(MovementFlags::ON_GROUND, false);
        if state.mode.on_foot() {
            log::debug!("walked off ground at {:?}", state.position);
            state.mode = MotionMode::Falling;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{SweepConfig, TraceShape};
    use crate::movement::modifiers::{ModifierTable, NoModifiers};

    fn floor_world() -> CollisionWorld {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(0.0, -0.5, 0.0), Vec3::new(50.0, 0.5, 50.0), ContentFlags::SOLID);
        world
    }

    fn run_ticks(
        kernel: &MovementKernel,
        world: &CollisionWorld,
        modifiers: &dyn MovementModifiers,
        start: MovementState,
        input: MoveInput,
        ticks: usize,
    ) -> Result<MovementState, StepAbort> {
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let mut sweeper = SweepEngine::new(SweepConfig::default());
        let mut env = StepEnv::new(world, &volumes, &mut sweeper, modifiers);

        let mut state = start;
        for _ in 0..ticks {
            state = kernel.step(&state, &input, 1.0 / 60.0, &mut env)?;
        }
        Ok(state)
    }

    #[test]
    fn test_substeps_split_long_moves() {
        let kernel = MovementKernel::default();
        let max = kernel.config.max_substep;

        assert_eq!(kernel.substeps(max).0, 1);
        assert_eq!(kernel.substeps(max * 2.5).0, 3);

        let (count, sub_dt) = kernel.substeps(100.0);
        assert_eq!(count, kernel.config.max_substeps);
        assert!((sub_dt - max).abs() < 1e-6, "total is truncated");
    }

    #[test]
    fn test_falling_entity_lands() {
        let world = floor_world();
        let kernel = MovementKernel::default();

        let state = run_ticks(
            &kernel,
            &world,
            &NoModifiers,
            MovementState::new(Vec3::new(0.0, 3.0, 0.0)),
            MoveInput::default(),
            120,
        )
        .unwrap();

        assert_eq!(state.mode, MotionMode::Grounded);
        assert!(state.flags.on_ground());
        assert!((state.position.y - 0.9).abs() < 0.02, "y={}", state.position.y);
    }

    #[test]
    fn test_step_is_deterministic() {
        let world = floor_world();
        let kernel = MovementKernel::default();
        let input = MoveInput::new(
            Vec3::new(1.0, 0.0, 0.5),
            glam::Quat::from_rotation_y(0.3),
            MoveFlags::default().with(MoveFlags::SPRINT),
        );
        let start = MovementState::grounded(Vec3::new(0.0, 0.91, 0.0));

        let a = run_ticks(&kernel, &world, &NoModifiers, start.clone(), input, 90).unwrap();
        let b = run_ticks(&kernel, &world, &NoModifiers, start, input, 90).unwrap();

        assert_eq!(a.position.to_array().map(f32::to_bits), b.position.to_array().map(f32::to_bits));
        assert_eq!(a.velocity.to_array().map(f32::to_bits), b.velocity.to_array().map(f32::to_bits));
        assert_eq!(a, b);
    }

    #[test]
    fn test_blocked_movement_aborts_without_commit() {
        let world = floor_world();
        let kernel = MovementKernel::default();
        let modifiers = ModifierTable {
            movement_blocked: true,
            ..Default::default()
        };

        let result = run_ticks(
            &kernel,
            &world,
            &modifiers,
            MovementState::grounded(Vec3::new(0.0, 0.9, 0.0)),
            MoveInput::toward(Vec3::X),
            1,
        );
        assert_eq!(result, Err(StepAbort::MovementBlocked));
    }

    #[test]
    fn test_missing_primary_volume_is_reported() {
        let world = floor_world();
        let kernel = MovementKernel::default();
        let volumes = CollisionVolumeSet::new();
        let mut sweeper = SweepEngine::new(SweepConfig::default());
        let mut env = StepEnv::new(&world, &volumes, &mut sweeper, &NoModifiers);

        let result = kernel.step(&MovementState::default(), &MoveInput::default(), 0.016, &mut env);
        assert_eq!(result, Err(StepAbort::MissingPrimaryVolume));
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let world = floor_world();
        let kernel = MovementKernel::default();
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let mut sweeper = SweepEngine::new(SweepConfig::default());
        let mut env = StepEnv::new(&world, &volumes, &mut sweeper, &NoModifiers);

        let result = kernel.step(&MovementState::default(), &MoveInput::default(), f32::NAN, &mut env);
        assert_eq!(result, Err(StepAbort::NonFiniteInput));
    }

    #[test]
    fn test_entering_water_switches_to_swimming() {
        let mut world = floor_world();
        world.add_box(Vec3::new(0.0, 5.0, 0.0), Vec3::new(10.0, 5.0, 10.0), ContentFlags::WATER);
        let kernel = MovementKernel::default();

        let state = run_ticks(
            &kernel,
            &world,
            &NoModifiers,
            MovementState::new(Vec3::new(0.0, 4.0, 0.0)),
            MoveInput::default(),
            1,
        )
        .unwrap();

        assert_eq!(state.mode, MotionMode::Swimming);
        assert!(state.flags.has(MovementFlags::IN_FLUID));
    }

    #[test]
    fn test_leaving_water_high_up_flies_when_allowed() {
        let world = floor_world();
        let kernel = MovementKernel::new(MovementConfig::flyer());
        let mut start = MovementState::new(Vec3::new(0.0, 20.0, 0.0));
        start.mode = MotionMode::Swimming;

        let state = run_ticks(&kernel, &world, &NoModifiers, start.clone(), MoveInput::default(), 1).unwrap();
        assert_eq!(state.mode, MotionMode::Flying);

        let grounded_kernel = MovementKernel::default();
        let state = run_ticks(&grounded_kernel, &world, &NoModifiers, start, MoveInput::default(), 1).unwrap();
        assert_eq!(state.mode, MotionMode::Falling);
    }

    #[test]
    fn test_maneuver_requires_permission() {
        let world = floor_world();
        let kernel = MovementKernel::default();
        let input = MoveInput::new(Vec3::ZERO, glam::Quat::IDENTITY, MoveFlags::default().with(MoveFlags::MANEUVER));
        let start = MovementState::grounded(Vec3::new(0.0, 0.9, 0.0));

        let state = run_ticks(&kernel, &world, &NoModifiers, start.clone(), input, 3).unwrap();
        assert_eq!(state.mode, MotionMode::Maneuvering);

        let blocked = ModifierTable {
            maneuver_blocked: true,
            ..Default::default()
        };
        let state = run_ticks(&kernel, &world, &blocked, start, input, 3).unwrap();
        assert_eq!(state.mode, MotionMode::Grounded);
    }

    #[test]
    fn test_incapacity_enters_and_exits() {
        let world = floor_world();
        let kernel = MovementKernel::default();
        let start = MovementState::grounded(Vec3::new(0.0, 0.9, 0.0));
        let stunned = ModifierTable {
            incapacitated: true,
            ..Default::default()
        };

        let state = run_ticks(&kernel, &world, &stunned, start, MoveInput::toward(Vec3::X), 2).unwrap();
        assert_eq!(state.mode, MotionMode::Incapacitated);

        let state = run_ticks(&kernel, &world, &NoModifiers, state, MoveInput::toward(Vec3::X), 1).unwrap();
        assert_eq!(state.mode, MotionMode::Grounded);
    }

    #[test]
    fn test_walking_off_ledge_falls() {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(0.0, -0.5, 0.0), Vec3::new(1.0, 0.5, 1.0), ContentFlags::SOLID);
        let kernel = MovementKernel::default();

        let state = run_ticks(
            &kernel,
            &world,
            &NoModifiers,
            MovementState::grounded(Vec3::new(0.0, 0.9, 0.0)),
            MoveInput::toward(Vec3::X),
            60,
        )
        .unwrap();

        assert_eq!(state.mode, MotionMode::Falling);
        assert!(state.position.y < 0.9);
    }
}
