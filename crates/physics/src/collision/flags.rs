//! Content flags for collision filtering.
//!
//! These flags determine what a trace collides with and which volumes count
//! as fluid for the swimming mode.

use serde::{Deserialize, Serialize};

/// Content flags describe what type of volume something is.
///
/// Used both as the contents of a world object and as the response mask of a
/// collision volume. A volume whose mask is empty does not collide at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentFlags(pub u32);

impl ContentFlags {
    /// Empty space - nothing here.
    pub const EMPTY: Self = Self(0);

    /// Solid world geometry - walls, floors, etc.
    pub const SOLID: Self = Self(1 << 0);

    /// Water volume - entering it switches the entity to swimming.
    pub const WATER: Self = Self(1 << 1);

    /// Player clip - blocks player entities but not projectiles.
    pub const PLAYER_CLIP: Self = Self(1 << 2);

    /// Another player's body.
    pub const PLAYER_BODY: Self = Self(1 << 3);

    /// Moving platform or other object an entity can be based on.
    pub const MOVER: Self = Self(1 << 4);

    /// Trigger volume - never blocks movement.
    pub const TRIGGER: Self = Self(1 << 5);

    /// Standard mask for entity movement sweeps.
    pub const MASK_MOVEMENT: Self = Self(
        Self::SOLID.0 | Self::PLAYER_CLIP.0 | Self::PLAYER_BODY.0 | Self::MOVER.0,
    );

    /// Mask of volumes that count as fluid.
    pub const MASK_FLUID: Self = Self::WATER;

    /// Check if these flags contain a specific flag.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the given flags are set.
    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Check if no flags are set.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Combine two flag sets.
    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Remove flags from this set.
    #[inline]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for ContentFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for ContentFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}
