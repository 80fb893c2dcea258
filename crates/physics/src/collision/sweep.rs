//! Multi-volume sweep engine.
//!
//! Moves an entity root pose and every collision volume attached to it as one
//! rigid body. Each enabled volume is traced along its own swept path; the
//! earliest blocking contact limits the whole move.
//!
//! Non-primary volumes flagged for async collision may be answered from a
//! cached result while a fresh query runs on the [`AsyncSweeper`] pool. Those
//! cached contacts are reported as *deferred*: they adjust velocity but never
//! block position.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use super::async_sweep::{AsyncSweeper, SweepHandle, SweepQuery};
use super::trace::{ObjectId, Pose, TraceResult};
use super::volumes::{CollisionVolumeSet, VolumeId};
use super::world::CollisionWorld;

/// Tuning for the sweep engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Distance to back off from a blocking contact so the entity does not
    /// rest exactly on the boundary.
    pub pull_back_distance: f32,

    /// Contacts on secondary volumes whose normal's up-component lies strictly
    /// inside this range are ramps, not walls, and are ignored.
    pub ramp_normal_range: (f32, f32),

    /// A start-penetrating contact is ignored when the move direction's dot
    /// with the push-out normal exceeds `-penetration_exit_tolerance`.
    pub penetration_exit_tolerance: f32,

    /// Fallback push along the impact normal when full depenetration would
    /// land in another penetration.
    pub penetration_nudge: f32,

    /// Overlap depth considered touching rather than penetrating.
    pub penetration_tolerance: f32,

    /// How many ticks a cached async result stays usable.
    pub async_max_age_ticks: u64,

    /// Worker threads for async volume sweeps. Zero sweeps everything on
    /// the simulation thread.
    pub async_workers: usize,

    /// Pending async queries allowed before sweeps fall back to synchronous.
    pub async_queue_depth: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            pull_back_distance: 0.002,
            ramp_normal_range: (0.08, 0.75),
            penetration_exit_tolerance: 0.1,
            penetration_nudge: 0.005,
            penetration_tolerance: 0.001,
            async_max_age_ticks: 4,
            async_workers: 0,
            async_queue_depth: 32,
        }
    }
}

/// What the sweep should treat as part of the entity's own motion.
#[derive(Debug, Clone, Copy)]
pub struct SweepContext<'a> {
    pub world: &'a CollisionWorld,
    /// Object the entity is standing on.
    pub base: Option<ObjectId>,
    /// Objects standing on the entity.
    pub riders: &'a [ObjectId],
}

impl<'a> SweepContext<'a> {
    pub fn new(world: &'a CollisionWorld) -> Self {
        Self {
            world,
            base: None,
            riders: &[],
        }
    }

    fn is_attached(&self, object: Option<ObjectId>) -> bool {
        match object {
            Some(id) => self.base == Some(id) || self.riders.contains(&id),
            None => false,
        }
    }
}

/// A contact found on one volume during a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepHit {
    pub volume: VolumeId,
    pub volume_index: usize,
    pub fraction: f32,
    /// Surface normal pointing back toward the entity.
    pub normal: Vec3,
    pub penetration_depth: f32,
    pub object: Option<ObjectId>,
    pub started_penetrating: bool,
}

/// Result of [`SweepEngine::sweep_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepOutcome {
    /// False when the move could not be attempted at all.
    pub accepted: bool,
    /// Earliest contact that limited the move.
    pub blocking: Option<SweepHit>,
    /// Cached contacts on async volumes. Velocity only.
    pub deferred: Vec<SweepHit>,
    /// Portion of the requested move that was applied.
    pub applied_fraction: f32,
}

impl SweepOutcome {
    fn rejected() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
struct CachedSweep {
    result: TraceResult,
    tick: u64,
}

/// Sweeps a multi-volume entity through a collision world.
#[derive(Debug, Default)]
pub struct SweepEngine {
    pub config: SweepConfig,
    sweeper: Option<AsyncSweeper>,
    cache: HashMap<VolumeId, CachedSweep>,
    in_flight: HashMap<VolumeId, SweepHandle>,
    tick: u64,
}

impl SweepEngine {
    /// Engine that runs every sweep synchronously.
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Engine that may defer non-primary async volumes to `sweeper`.
    pub fn with_async(config: SweepConfig, sweeper: AsyncSweeper) -> Self {
        Self {
            config,
            sweeper: Some(sweeper),
            ..Default::default()
        }
    }

    /// Engine for `world`, with an async worker pool when the config asks
    /// for one.
    pub fn for_world(config: SweepConfig, world: &Arc<CollisionWorld>) -> Self {
        if config.async_workers == 0 {
            return Self::new(config);
        }
        log::debug!(
            "starting {} async sweep workers (queue depth {})",
            config.async_workers,
            config.async_queue_depth
        );
        let sweeper = AsyncSweeper::spawn(Arc::clone(world), config.async_workers, config.async_queue_depth);
        Self::with_async(config, sweeper)
    }

    /// Whether async volumes may be deferred to a worker pool.
    pub fn is_async(&self) -> bool {
        self.sweeper.is_some()
    }

    /// Advance the cache clock and collect finished async results.
    pub fn begin_tick(&mut self) {
        self.tick += 1;

        let Some(sweeper) = self.sweeper.as_mut() else {
            return;
        };

        let tick = self.tick;
        let cache = &mut self.cache;
        self.in_flight.retain(|volume, handle| match sweeper.poll(handle) {
            Some(result) => {
                cache.insert(*volume, CachedSweep { result, tick });
                false
            }
            None => true,
        });
    }

    /// Forget cached async results (e.g. after a teleport or correction).
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Move the entity root by `delta` and `rotation_delta`.
    ///
    /// On return `root` holds the furthest clear pose, pulled back slightly
    /// from any blocking contact. A start-penetrating block triggers one
    /// depenetration attempt followed by a retry of the move.
    pub fn sweep_all(
        &mut self,
        ctx: &SweepContext<'_>,
        root: &mut Pose,
        volumes: &CollisionVolumeSet,
        delta: Vec3,
        rotation_delta: Quat,
    ) -> SweepOutcome {
        if volumes.primary().is_none() {
            log::warn!("sweep requested for an entity with no primary collision volume");
            return SweepOutcome::rejected();
        }

        let outcome = self.sweep_once(ctx, root, volumes, delta, rotation_delta);

        match outcome.blocking {
            Some(hit) if hit.started_penetrating => {
                log::trace!(
                    "volume {} started penetrating (depth {:.4}), resolving",
                    hit.volume,
                    hit.penetration_depth
                );
                if self.resolve_penetration(ctx, root, volumes) {
                    self.sweep_once(ctx, root, volumes, delta, rotation_delta)
                } else {
                    outcome
                }
            }
            _ => outcome,
        }
    }

    fn sweep_once(
        &mut self,
        ctx: &SweepContext<'_>,
        root: &mut Pose,
        volumes: &CollisionVolumeSet,
        delta: Vec3,
        rotation_delta: Quat,
    ) -> SweepOutcome {
        let target = Pose {
            position: root.position + delta,
            rotation: (rotation_delta * root.rotation).normalize(),
        };

        let mut blocking: Option<SweepHit> = None;
        let mut deferred = Vec::new();

        for (index, volume) in volumes.iter().enumerate() {
            if !volume.is_enabled() {
                continue;
            }

            let start = root.compose(&volume.offset);
            let end = target.compose(&volume.offset);

            if index > 0 && volume.async_collision {
                if let Some(cached) = self.fresh_cached(volume.id) {
                    let query = SweepQuery {
                        start,
                        end,
                        shape: volume.shape,
                        mask: volume.response,
                    };
                    if self.submit(volume.id, query) {
                        if let Some(hit) = to_hit(volume.id, index, &cached) {
                            if !self.ignore_hit(ctx, &hit, delta) {
                                deferred.push(hit);
                            }
                        }
                        continue;
                    }
                }
            }

            let trace = ctx.world.trace(&start, &end, volume.shape, volume.response);

            if index > 0 && volume.async_collision && self.sweeper.is_some() {
                self.cache.insert(
                    volume.id,
                    CachedSweep {
                        result: trace.clone(),
                        tick: self.tick,
                    },
                );
            }

            let Some(hit) = to_hit(volume.id, index, &trace) else {
                continue;
            };

            if self.ignore_hit(ctx, &hit, delta) {
                log::trace!("ignoring contact on volume {} normal {:?}", hit.volume, hit.normal);
                continue;
            }

            if blocking.map_or(true, |b| hit.fraction < b.fraction) {
                blocking = Some(hit);
            }
        }

        let applied_fraction = match blocking {
            None => 1.0,
            Some(hit) if hit.started_penetrating => 0.0,
            Some(hit) => {
                let distance = delta.length();
                if distance > f32::EPSILON {
                    (hit.fraction - self.config.pull_back_distance / distance).max(0.0)
                } else {
                    0.0
                }
            }
        };

        *root = root.interpolate(&target, applied_fraction);

        SweepOutcome {
            accepted: true,
            blocking,
            deferred,
            applied_fraction,
        }
    }

    /// Whether any enabled volume overlaps blocking geometry beyond tolerance.
    pub fn is_penetrating(&self, ctx: &SweepContext<'_>, root: &Pose, volumes: &CollisionVolumeSet) -> bool {
        self.deepest_penetration(ctx, root, volumes)
            .is_some_and(|(_, depth)| depth > self.config.penetration_tolerance)
    }

    /// Push the entity out of whatever it overlaps.
    ///
    /// Tries a full push-out along the deepest contact; if the pushed pose
    /// still penetrates, applies a small nudge along that normal instead.
    /// Returns whether the entity ended up clear.
    pub fn resolve_penetration(
        &self,
        ctx: &SweepContext<'_>,
        root: &mut Pose,
        volumes: &CollisionVolumeSet,
    ) -> bool {
        let tolerance = self.config.penetration_tolerance;

        let Some((normal, depth)) = self.deepest_penetration(ctx, root, volumes) else {
            return true;
        };
        if depth <= tolerance {
            return true;
        }

        let pushed = root.translated(normal * (depth + tolerance));
        let clear = self
            .deepest_penetration(ctx, &pushed, volumes)
            .map_or(true, |(_, d)| d <= tolerance);

        if clear {
            *root = pushed;
            return true;
        }

        log::debug!("depenetration blocked, nudging by {}", self.config.penetration_nudge);
        *root = root.translated(normal * self.config.penetration_nudge);
        false
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn deepest_penetration(
        &self,
        ctx: &SweepContext<'_>,
        root: &Pose,
        volumes: &CollisionVolumeSet,
    ) -> Option<(Vec3, f32)> {
        volumes
            .iter()
            .filter(|v| v.is_enabled())
            .flat_map(|v| {
                let pose = root.compose(&v.offset);
                ctx.world.overlaps(&pose, v.shape, v.response)
            })
            .filter(|o| !ctx.is_attached(Some(o.object)))
            .max_by(|a, b| a.depth.total_cmp(&b.depth))
            .map(|o| (o.normal, o.depth))
    }

    fn ignore_hit(&self, ctx: &SweepContext<'_>, hit: &SweepHit, delta: Vec3) -> bool {
        if ctx.is_attached(hit.object) {
            return true;
        }

        let (low, high) = self.config.ramp_normal_range;
        if hit.volume_index > 0 && hit.normal.y > low && hit.normal.y < high {
            return true;
        }

        if hit.started_penetrating {
            let direction = delta.normalize_or_zero();
            if direction != Vec3::ZERO
                && direction.dot(hit.normal) > -self.config.penetration_exit_tolerance
            {
                return true;
            }
        }

        false
    }

    fn fresh_cached(&self, volume: VolumeId) -> Option<TraceResult> {
        self.sweeper.as_ref()?;
        let cached = self.cache.get(&volume)?;
        (self.tick.saturating_sub(cached.tick) <= self.config.async_max_age_ticks)
            .then(|| cached.result.clone())
    }

    /// Queue a fresh sweep for `volume` unless one is already running.
    /// Returns false when the caller must fall back to a synchronous sweep.
    fn submit(&mut self, volume: VolumeId, query: SweepQuery) -> bool {
        if self.in_flight.contains_key(&volume) {
            return true;
        }
        let Some(sweeper) = self.sweeper.as_mut() else {
            return false;
        };
        match sweeper.submit(query) {
            Ok(handle) => {
                self.in_flight.insert(volume, handle);
                true
            }
            Err(err) => {
                log::debug!("async sweep for volume {} not queued: {}", volume, err);
                false
            }
        }
    }
}

fn to_hit(volume: VolumeId, index: usize, trace: &TraceResult) -> Option<SweepHit> {
    if !trace.hit_something() {
        return None;
    }
    Some(SweepHit {
        volume,
        volume_index: index,
        fraction: trace.fraction,
        normal: trace.normal_or_up(),
        penetration_depth: trace.penetration_depth,
        object: trace.hit_object,
        started_penetrating: trace.started_in_solid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{CollisionVolume, ContentFlags, TraceShape};

    fn walled_world() -> (CollisionWorld, ObjectId) {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(0.0, -0.5, 0.0), Vec3::new(50.0, 0.5, 50.0), ContentFlags::SOLID);
        let wall = world.add_box(Vec3::new(5.0, 2.0, 0.0), Vec3::new(0.5, 2.0, 5.0), ContentFlags::SOLID);
        (world, wall)
    }

    fn standing() -> Pose {
        Pose::from_position(Vec3::new(0.0, 0.95, 0.0))
    }

    #[test]
    fn test_blocking_contact_leaves_no_penetration() {
        let (world, _) = walled_world();
        let ctx = SweepContext::new(&world);
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let mut engine = SweepEngine::new(SweepConfig::default());

        let mut root = standing();
        let outcome = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY);

        assert!(outcome.accepted);
        let hit = outcome.blocking.expect("wall blocks the move");
        assert!(hit.normal.x < -0.9);
        assert!(outcome.applied_fraction < hit.fraction, "pull-back applied");
        assert!(root.position.x < 4.1, "x={}", root.position.x);
        assert!(!engine.is_penetrating(&ctx, &root, &volumes), "must end clear of geometry");
    }

    #[test]
    fn test_missing_primary_rejects_move() {
        let (world, _) = walled_world();
        let ctx = SweepContext::new(&world);
        let mut engine = SweepEngine::new(SweepConfig::default());

        let mut root = standing();
        let outcome = engine.sweep_all(
            &ctx,
            &mut root,
            &CollisionVolumeSet::new(),
            Vec3::new(1.0, 0.0, 0.0),
            Quat::IDENTITY,
        );

        assert!(!outcome.accepted);
        assert_eq!(root, standing(), "root must not move");
    }

    #[test]
    fn test_base_object_is_ignored() {
        let (world, wall) = walled_world();
        let riders = [];
        let ctx = SweepContext {
            world: &world,
            base: Some(wall),
            riders: &riders,
        };
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let mut engine = SweepEngine::new(SweepConfig::default());

        let mut root = standing();
        let outcome = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY);

        assert!(outcome.blocking.is_none(), "contact with own base is ignored");
        assert!((root.position.x - 10.0).abs() < 1e-4);
    }

    fn ramp_world() -> CollisionWorld {
        let mut world = CollisionWorld::new();
        world.add_oriented_box(
            Pose::new(Vec3::new(4.0, 0.0, 0.0), Quat::from_rotation_z(std::f32::consts::FRAC_PI_4)),
            Vec3::new(2.0, 0.5, 2.0),
            ContentFlags::SOLID,
        );
        world
    }

    fn ramp_volumes() -> CollisionVolumeSet {
        let mut volumes = CollisionVolumeSet::single(TraceShape::Sphere { radius: 0.2 });
        volumes.add(CollisionVolume::new(
            1,
            TraceShape::Sphere { radius: 0.2 },
            Pose::from_position(Vec3::new(1.0, -3.0, 0.0)),
        ));
        volumes
    }

    #[test]
    fn test_secondary_volume_ignores_ramp_faces() {
        let world = ramp_world();
        let ctx = SweepContext::new(&world);
        let volumes = ramp_volumes();
        let mut engine = SweepEngine::new(SweepConfig::default());

        let mut root = Pose::from_position(Vec3::new(0.0, 3.0, 0.0));
        let outcome = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY);

        assert!(outcome.blocking.is_none(), "ramp is not a wall for a secondary volume");
        assert!((root.position.x - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_secondary_volume_blocks_outside_ramp_range() {
        let world = ramp_world();
        let ctx = SweepContext::new(&world);
        let volumes = ramp_volumes();
        let mut engine = SweepEngine::new(SweepConfig {
            ramp_normal_range: (0.9, 1.0),
            ..SweepConfig::default()
        });

        let mut root = Pose::from_position(Vec3::new(0.0, 3.0, 0.0));
        let outcome = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY);

        let hit = outcome.blocking.expect("ramp face blocks");
        assert_eq!(hit.volume, 1);
        assert!(root.position.x < 3.0);
    }

    #[test]
    fn test_resolve_penetration_pushes_out_of_floor() {
        let (world, _) = walled_world();
        let ctx = SweepContext::new(&world);
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let engine = SweepEngine::new(SweepConfig::default());

        let mut root = Pose::from_position(Vec3::new(0.0, 0.7, 0.0));
        assert!(engine.is_penetrating(&ctx, &root, &volumes));

        assert!(engine.resolve_penetration(&ctx, &mut root, &volumes));
        assert!(root.position.y >= 0.9, "y={}", root.position.y);
        assert!(!engine.is_penetrating(&ctx, &root, &volumes));
    }

    #[test]
    fn test_moving_out_of_penetration_is_not_blocked() {
        let (world, _) = walled_world();
        let ctx = SweepContext::new(&world);
        let volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
        let mut engine = SweepEngine::new(SweepConfig::default());

        let mut root = Pose::from_position(Vec3::new(0.0, 0.85, 0.0));
        let outcome = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(0.0, 0.5, 0.0), Quat::IDENTITY);

        assert!(outcome.blocking.is_none());
        assert!((root.position.y - 1.35).abs() < 1e-4);
    }

    #[test]
    fn test_config_selects_async_workers() {
        let world = Arc::new(CollisionWorld::new());
        assert!(!SweepEngine::for_world(SweepConfig::default(), &world).is_async());

        let config = SweepConfig {
            async_workers: 2,
            ..SweepConfig::default()
        };
        assert!(SweepEngine::for_world(config, &world).is_async());
    }

    #[test]
    fn test_async_volume_reports_cached_contact_as_deferred() {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(3.0, 0.0, 0.0), Vec3::new(0.5, 0.5, 2.0), ContentFlags::SOLID);
        let world = Arc::new(world);

        let mut volumes = CollisionVolumeSet::single(TraceShape::Sphere { radius: 0.2 });
        volumes.add(
            CollisionVolume::new(1, TraceShape::Sphere { radius: 0.2 }, Pose::from_position(Vec3::new(0.0, -5.0, 0.0)))
                .with_async(),
        );
        // Secondary sits level with the box; primary passes over it.
        let start = Pose::from_position(Vec3::new(0.0, 5.0, 0.0));

        let sweeper = AsyncSweeper::spawn(Arc::clone(&world), 1, 4);
        let mut engine = SweepEngine::with_async(SweepConfig::default(), sweeper);
        let ctx = SweepContext::new(&world);

        engine.begin_tick();
        let mut root = start;
        let first = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(5.0, 0.0, 0.0), Quat::IDENTITY);
        assert!(first.blocking.is_some(), "no cache yet, secondary sweeps synchronously");

        let mut root = start;
        let second = engine.sweep_all(&ctx, &mut root, &volumes, Vec3::new(5.0, 0.0, 0.0), Quat::IDENTITY);
        assert!(second.blocking.is_none(), "cached async contact never blocks");
        assert_eq!(second.deferred.len(), 1);
        assert!((root.position.x - 5.0).abs() < 1e-4);
    }
}
