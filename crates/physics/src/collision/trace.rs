//! Poses, trace shapes and trace results for collision queries.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use super::flags::ContentFlags;

/// Identifier of an object in the collision world.
pub type ObjectId = u32;

/// A rigid transform: position plus orientation.
///
/// Shapes are centered on their pose. An entity's root pose is the pose of its
/// primary collision volume's parent; every volume is placed relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    /// Pose at a position with no rotation.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Compose a local pose onto this one (`self` is the parent).
    #[inline]
    pub fn compose(&self, local: &Pose) -> Pose {
        Pose {
            position: self.position + self.rotation * local.position,
            rotation: (self.rotation * local.rotation).normalize(),
        }
    }

    /// Interpolate toward `other`: linear in position, spherical in rotation.
    #[inline]
    pub fn interpolate(&self, other: &Pose, t: f32) -> Pose {
        Pose {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(other.rotation, t),
        }
    }

    /// Translate by a world-space delta.
    #[inline]
    pub fn translated(&self, delta: Vec3) -> Pose {
        Pose {
            position: self.position + delta,
            rotation: self.rotation,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite()
    }
}

/// Shape used for collision traces.
///
/// All shapes are centered on their pose. Capsules are aligned with the local
/// Y axis, so a rotated volume can lie along the entity's body (e.g. a
/// quadruped's torso).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TraceShape {
    /// A capsule along the local Y axis.
    Capsule {
        /// Radius of the capsule cylinder and end caps.
        radius: f32,
        /// Total height from bottom of lower cap to top of upper cap.
        height: f32,
    },

    /// An oriented box.
    Box {
        /// Half-size in each local axis.
        half_extents: Vec3,
    },

    /// A sphere.
    Sphere {
        radius: f32,
    },
}

impl TraceShape {
    /// A standing humanoid capsule.
    pub const HUMANOID: Self = Self::Capsule {
        radius: 0.4,
        height: 1.8,
    };

    /// Smallest half-extent of this shape. Used to size trace sub-steps so a
    /// fast sweep cannot skip over thin geometry.
    pub fn min_half_extent(&self) -> f32 {
        match self {
            Self::Capsule { radius, .. } => *radius,
            Self::Box { half_extents } => half_extents.min_element(),
            Self::Sphere { radius } => *radius,
        }
    }

    /// Distance from the shape's center to its lowest point when unrotated.
    pub fn half_height(&self) -> f32 {
        match self {
            Self::Capsule { radius, height } => (height * 0.5).max(*radius),
            Self::Box { half_extents } => half_extents.y,
            Self::Sphere { radius } => *radius,
        }
    }
}

impl Default for TraceShape {
    fn default() -> Self {
        Self::HUMANOID
    }
}

/// Result of a collision trace through the world.
///
/// Traces sweep a shape from a start pose to an end pose and report the first
/// blocking contact along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Time of impact along the trace, `0.0..=1.0`.
    ///
    /// - `1.0` = traveled the full distance (no collision)
    /// - `0.0` = blocked immediately at start
    pub fraction: f32,

    /// Last pose along the path that is clear of blocking geometry.
    pub end_pose: Pose,

    /// Surface normal of the blocking geometry, pointing toward the shape.
    ///
    /// `None` if no collision occurred.
    pub hit_normal: Option<Vec3>,

    /// How deep the shape would sink into the blocker just past `fraction`
    /// (or at the start, when `started_in_solid`).
    pub penetration_depth: f32,

    /// Content flags of what was hit.
    pub hit_contents: ContentFlags,

    /// Object that was hit.
    pub hit_object: Option<ObjectId>,

    /// Whether the trace started inside blocking geometry.
    pub started_in_solid: bool,

    /// Whether the end pose is blocked as well as the start.
    pub all_solid: bool,
}

impl Default for TraceResult {
    fn default() -> Self {
        Self::no_hit(Pose::IDENTITY)
    }
}

impl TraceResult {
    /// Create a trace result indicating no collision occurred.
    pub fn no_hit(end_pose: Pose) -> Self {
        Self {
            fraction: 1.0,
            end_pose,
            hit_normal: None,
            penetration_depth: 0.0,
            hit_contents: ContentFlags::EMPTY,
            hit_object: None,
            started_in_solid: false,
            all_solid: false,
        }
    }

    /// Check if this trace hit something.
    #[inline]
    pub fn hit_something(&self) -> bool {
        self.fraction < 1.0 || self.started_in_solid
    }

    /// Get the hit normal, defaulting to up if none.
    #[inline]
    pub fn normal_or_up(&self) -> Vec3 {
        self.hit_normal.unwrap_or(Vec3::Y)
    }
}

/// One overlapping object found by an overlap query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlap {
    pub object: ObjectId,
    /// Direction to push the shape to separate it from the object.
    pub normal: Vec3,
    /// Penetration depth along `normal`.
    pub depth: f32,
    pub contents: ContentFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_result_no_hit() {
        let result = TraceResult::no_hit(Pose::from_position(Vec3::new(10.0, 0.0, 0.0)));
        assert!(!result.hit_something());
        assert_eq!(result.fraction, 1.0);
        assert!(result.hit_normal.is_none());
    }

    #[test]
    fn test_pose_compose_applies_parent_rotation() {
        let parent = Pose::new(
            Vec3::new(1.0, 0.0, 0.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        let local = Pose::from_position(Vec3::new(1.0, 0.0, 0.0));

        let world = parent.compose(&local);

        // +X rotated a quarter turn about Y points along -Z.
        assert!((world.position - Vec3::new(1.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn test_shape_extents() {
        let capsule = TraceShape::Capsule {
            radius: 0.5,
            height: 2.0,
        };
        assert_eq!(capsule.min_half_extent(), 0.5);
        assert_eq!(capsule.half_height(), 1.0);

        let slab = TraceShape::Box {
            half_extents: Vec3::new(2.0, 0.25, 1.0),
        };
        assert_eq!(slab.min_half_extent(), 0.25);
    }
}
