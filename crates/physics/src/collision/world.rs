//! Collision world containing all static and dynamic geometry.
//!
//! The collision world stores all collidable geometry and answers trace,
//! overlap and point-content queries against it.

use glam::{Quat, Vec3};
use parry3d::math::{Isometry, Point, Real};
use parry3d::na::{Quaternion, Translation3, UnitQuaternion};
use parry3d::query::{contact, PointQuery};
use parry3d::shape::SharedShape;

use super::flags::ContentFlags;
use super::trace::{ObjectId, Overlap, Pose, TraceResult, TraceShape};

/// Number of bisection steps used to refine a time of impact.
/// 12 iterations gives ~0.025% precision of the bracketing interval.
const REFINE_ITERATIONS: usize = 12;

/// Upper bound on coarse samples taken along one trace.
const MAX_TRACE_SAMPLES: usize = 64;

/// A piece of collision geometry in the world.
#[derive(Debug, Clone)]
pub struct CollisionObject {
    /// Unique identifier for this object.
    pub id: ObjectId,
    /// The collision shape.
    pub shape: SharedShape,
    /// Position and orientation in world space.
    pub transform: Isometry<Real>,
    /// Content flags (solid, water, mover, etc.).
    pub contents: ContentFlags,
}

/// The collision world containing all geometry.
///
/// # Thread Safety
///
/// Movement never mutates the world. Once built it is shared behind an `Arc`
/// so the async sweep workers can query it in parallel with the simulation.
#[derive(Debug, Default)]
pub struct CollisionWorld {
    objects: Vec<CollisionObject>,
    next_id: ObjectId,
}

impl CollisionWorld {
    /// Create an empty collision world.
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            next_id: 0,
        }
    }

    /// Add an axis-aligned box to the world.
    ///
    /// # Arguments
    ///
    /// * `center` - Center position of the box in world space
    /// * `half_extents` - Half-size in each axis (x, y, z)
    /// * `contents` - Content flags for collision filtering
    pub fn add_box(&mut self, center: Vec3, half_extents: Vec3, contents: ContentFlags) -> ObjectId {
        self.add_oriented_box(Pose::from_position(center), half_extents, contents)
    }

    /// Add a rotated box to the world. Tilted boxes make ramps.
    pub fn add_oriented_box(
        &mut self,
        pose: Pose,
        half_extents: Vec3,
        contents: ContentFlags,
    ) -> ObjectId {
        let shape = SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z);
        self.push(shape, to_isometry(&pose), contents)
    }

    /// Add a convex hull to the world.
    ///
    /// Returns the object ID, or `None` if the hull couldn't be computed.
    pub fn add_convex_hull(&mut self, points: &[Vec3], contents: ContentFlags) -> Option<ObjectId> {
        let parry_points: Vec<Point<Real>> = points
            .iter()
            .map(|p| Point::new(p.x, p.y, p.z))
            .collect();

        let shape = SharedShape::convex_hull(&parry_points)?;
        Some(self.push(shape, Isometry::identity(), contents))
    }

    /// Remove an object. Returns whether it existed.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        let before = self.objects.len();
        self.objects.retain(|o| o.id != id);
        self.objects.len() != before
    }

    /// Remove all collision geometry.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Get the number of collision objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn push(&mut self, shape: SharedShape, transform: Isometry<Real>, contents: ContentFlags) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.push(CollisionObject {
            id,
            shape,
            transform,
            contents,
        });
        id
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Union of the contents of every object containing `point`.
    ///
    /// Used for fluid detection.
    pub fn contents_at(&self, point: Vec3) -> ContentFlags {
        let p = Point::new(point.x, point.y, point.z);
        self.objects
            .iter()
            .filter(|o| o.shape.contains_point(&o.transform, &p))
            .fold(ContentFlags::EMPTY, |acc, o| acc | o.contents)
    }

    /// Check if a shape at a pose intersects any geometry matching `mask`.
    pub fn is_blocked(&self, pose: &Pose, shape: TraceShape, mask: ContentFlags) -> bool {
        let test_shape = parry_shape(shape);
        let test_transform = to_isometry(pose);

        self.objects
            .iter()
            .filter(|o| mask.intersects(o.contents))
            .any(|o| {
                matches!(
                    contact(&test_transform, test_shape.as_ref(), &o.transform, o.shape.as_ref(), 0.0),
                    Ok(Some(c)) if c.dist < 0.0
                )
            })
    }

    /// Every object the shape penetrates, with push-out direction and depth.
    pub fn overlaps(&self, pose: &Pose, shape: TraceShape, mask: ContentFlags) -> Vec<Overlap> {
        let test_shape = parry_shape(shape);
        let test_transform = to_isometry(pose);

        let mut found = Vec::new();
        for object in &self.objects {
            if !mask.intersects(object.contents) {
                continue;
            }

            if let Ok(Some(c)) = contact(
                &test_transform,
                test_shape.as_ref(),
                &object.transform,
                object.shape.as_ref(),
                0.0,
            ) {
                // Negative distance means penetration. normal2 is the outward
                // normal of the object, i.e. the direction to push us.
                let depth = -c.dist;
                if depth > 0.0 {
                    found.push(Overlap {
                        object: object.id,
                        normal: Vec3::new(c.normal2.x, c.normal2.y, c.normal2.z),
                        depth,
                        contents: object.contents,
                    });
                }
            }
        }
        found
    }

    /// The deepest overlap at a pose, if any.
    pub fn deepest_overlap(&self, pose: &Pose, shape: TraceShape, mask: ContentFlags) -> Option<Overlap> {
        self.overlaps(pose, shape, mask)
            .into_iter()
            .max_by(|a, b| a.depth.total_cmp(&b.depth))
    }

    /// Sum of push-out vectors needed to clear every overlap at `pose`.
    pub fn penetration_correction(&self, pose: &Pose, shape: TraceShape, mask: ContentFlags) -> Vec3 {
        self.overlaps(pose, shape, mask)
            .iter()
            .fold(Vec3::ZERO, |acc, o| acc + o.normal * o.depth)
    }

    /// Trace a shape through the world.
    ///
    /// This is the primary collision query. It sweeps the given shape from
    /// `start` to `end` (interpolating rotation as well as position) and
    /// returns the first blocking contact.
    pub fn trace(&self, start: &Pose, end: &Pose, shape: TraceShape, mask: ContentFlags) -> TraceResult {
        if let Some(overlap) = self.deepest_overlap(start, shape, mask) {
            return TraceResult {
                fraction: 0.0,
                end_pose: *start,
                hit_normal: Some(overlap.normal),
                penetration_depth: overlap.depth,
                hit_contents: overlap.contents,
                hit_object: Some(overlap.object),
                started_in_solid: true,
                all_solid: self.is_blocked(end, shape, mask),
            };
        }

        let distance = (end.position - start.position).length();
        let angle = start.rotation.angle_between(end.rotation);
        if distance < 1e-5 && angle < 1e-5 {
            return TraceResult::no_hit(*end);
        }

        // Coarse march so a fast shape cannot step over thin geometry, then
        // bisect inside the first blocked interval.
        let step = (shape.min_half_extent() * 0.5).max(0.01);
        let samples = ((distance / step).ceil() as usize).clamp(1, MAX_TRACE_SAMPLES);

        let mut clear_t = 0.0_f32;
        for i in 1..=samples {
            let t = i as f32 / samples as f32;
            let pose = start.interpolate(end, t);
            if self.is_blocked(&pose, shape, mask) {
                return self.refine_hit(start, end, shape, mask, clear_t, t);
            }
            clear_t = t;
        }

        TraceResult::no_hit(*end)
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Bisect between a clear and a blocked time to find the time of impact.
    fn refine_hit(
        &self,
        start: &Pose,
        end: &Pose,
        shape: TraceShape,
        mask: ContentFlags,
        clear_t: f32,
        blocked_t: f32,
    ) -> TraceResult {
        let mut lo = clear_t;
        let mut hi = blocked_t;

        for _ in 0..REFINE_ITERATIONS {
            let mid = (lo + hi) * 0.5;
            if self.is_blocked(&start.interpolate(end, mid), shape, mask) {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let end_pose = start.interpolate(end, lo);
        let blocked_pose = start.interpolate(end, hi);

        let (normal, depth, contents, object) = match self.deepest_overlap(&blocked_pose, shape, mask) {
            Some(o) => (o.normal, o.depth, o.contents, Some(o.object)),
            None => {
                // Default to opposite of movement direction.
                let direction = (end.position - start.position).normalize_or_zero();
                let fallback = if direction.length_squared() > 0.5 { -direction } else { Vec3::Y };
                (fallback, 0.0, ContentFlags::SOLID, None)
            }
        };

        TraceResult {
            fraction: lo,
            end_pose,
            hit_normal: Some(normal),
            penetration_depth: depth,
            hit_contents: contents,
            hit_object: object,
            started_in_solid: false,
            all_solid: false,
        }
    }
}

/// Convert a pose into a parry isometry.
pub(crate) fn to_isometry(pose: &Pose) -> Isometry<Real> {
    let q: Quat = pose.rotation;
    Isometry::from_parts(
        Translation3::new(pose.position.x, pose.position.y, pose.position.z),
        UnitQuaternion::new_normalize(Quaternion::new(q.w, q.x, q.y, q.z)),
    )
}

/// Create a parry3d shape from our TraceShape.
fn parry_shape(shape: TraceShape) -> SharedShape {
    match shape {
        TraceShape::Capsule { radius, height } => {
            // Parry capsule is defined by half-height of the cylinder part
            let cylinder_half_height = (height - 2.0 * radius).max(0.0) / 2.0;
            SharedShape::capsule_y(cylinder_half_height, radius)
        }
        TraceShape::Box { half_extents } => {
            SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z)
        }
        TraceShape::Sphere { radius } => SharedShape::ball(radius),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_world() -> CollisionWorld {
        let mut world = CollisionWorld::new();

        // Floor with its top face at y=0
        world.add_box(
            Vec3::new(0.0, -0.5, 0.0),
            Vec3::new(50.0, 0.5, 50.0),
            ContentFlags::SOLID,
        );

        // Wall whose near face is at x=9.5
        world.add_box(
            Vec3::new(10.0, 2.5, 0.0),
            Vec3::new(0.5, 2.5, 10.0),
            ContentFlags::SOLID,
        );

        world
    }

    #[test]
    fn test_trace_capsule_stops_before_wall() {
        let world = create_test_world();
        let shape = TraceShape::HUMANOID;

        let result = world.trace(
            &Pose::from_position(Vec3::new(0.0, 1.0, 0.0)),
            &Pose::from_position(Vec3::new(15.0, 1.0, 0.0)),
            shape,
            ContentFlags::SOLID,
        );

        assert!(result.hit_something());
        assert!(result.end_pose.position.x < 9.5 - 0.35, "x={}", result.end_pose.position.x);
        assert!(result.end_pose.position.x > 9.0, "x={}", result.end_pose.position.x);
        let normal = result.hit_normal.unwrap();
        assert!(normal.x < -0.9, "wall normal should face -X, got {:?}", normal);
    }

    #[test]
    fn test_trace_does_not_tunnel_through_thin_wall() {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(5.0, 0.0, 0.0), Vec3::new(0.05, 2.0, 2.0), ContentFlags::SOLID);

        let shape = TraceShape::Sphere { radius: 0.2 };
        let result = world.trace(
            &Pose::from_position(Vec3::ZERO),
            &Pose::from_position(Vec3::new(10.0, 0.0, 0.0)),
            shape,
            ContentFlags::SOLID,
        );

        assert!(result.hit_something(), "fast sweep must not skip thin geometry");
        assert!(result.end_pose.position.x < 4.95);
    }

    #[test]
    fn test_trace_reports_start_penetration() {
        let world = create_test_world();

        let result = world.trace(
            &Pose::from_position(Vec3::new(0.0, 0.7, 0.0)),
            &Pose::from_position(Vec3::new(1.0, 0.7, 0.0)),
            TraceShape::HUMANOID,
            ContentFlags::SOLID,
        );

        assert!(result.started_in_solid);
        assert_eq!(result.fraction, 0.0);
        assert!(result.penetration_depth > 0.1);
        assert!(result.normal_or_up().y > 0.9);
    }

    #[test]
    fn test_overlap_reports_floor_object() {
        let world = create_test_world();

        let overlap = world
            .deepest_overlap(
                &Pose::from_position(Vec3::new(0.0, 0.8, 0.0)),
                TraceShape::HUMANOID,
                ContentFlags::SOLID,
            )
            .expect("capsule center 0.8 above a floor sinks 0.1 into it");

        assert_eq!(overlap.object, 0);
        assert!((overlap.depth - 0.1).abs() < 0.01, "depth={}", overlap.depth);
    }

    #[test]
    fn test_content_mask_filtering() {
        let mut world = CollisionWorld::new();

        world.add_box(Vec3::new(5.0, 1.0, 0.0), Vec3::new(0.5, 1.0, 5.0), ContentFlags::SOLID);
        world.add_box(Vec3::new(3.0, 1.0, 0.0), Vec3::new(0.5, 1.0, 5.0), ContentFlags::TRIGGER);

        let result = world.trace(
            &Pose::from_position(Vec3::new(0.0, 1.0, 0.0)),
            &Pose::from_position(Vec3::new(10.0, 1.0, 0.0)),
            TraceShape::Sphere { radius: 0.1 },
            ContentFlags::MASK_MOVEMENT,
        );

        assert!(result.hit_something());
        // Should hit the wall at x=4.5, not the trigger at x=2.5
        assert!((result.end_pose.position.x - 4.4).abs() < 0.05);
    }

    #[test]
    fn test_contents_at_detects_water() {
        let mut world = CollisionWorld::new();
        world.add_box(Vec3::new(0.0, -2.0, 0.0), Vec3::new(10.0, 2.0, 10.0), ContentFlags::WATER);

        assert!(world.contents_at(Vec3::new(0.0, -1.0, 0.0)).contains(ContentFlags::WATER));
        assert!(world.contents_at(Vec3::new(0.0, 1.0, 0.0)).is_empty());
    }
}
