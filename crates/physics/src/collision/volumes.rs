//! Collision volumes attached to a movable entity.
//!
//! An entity is a root pose plus an ordered set of rigid volumes that move
//! with it. Volume 0 is the primary volume: it is always swept synchronously
//! and is the shape used for ground checks and fluid detection.

use serde::{Deserialize, Serialize};

use super::flags::ContentFlags;
use super::trace::{Pose, TraceShape};

/// Stable identifier of a volume within its set.
pub type VolumeId = u16;

/// A rigid collision volume offset from the entity root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionVolume {
    pub id: VolumeId,
    pub shape: TraceShape,
    /// Pose relative to the entity root.
    pub offset: Pose,
    /// Which world contents this volume collides with. Empty = disabled.
    pub response: ContentFlags,
    /// Allow this volume's sweep to be deferred to the async worker pool.
    /// Ignored for the primary volume.
    pub async_collision: bool,
}

impl CollisionVolume {
    pub fn new(id: VolumeId, shape: TraceShape, offset: Pose) -> Self {
        Self {
            id,
            shape,
            offset,
            response: ContentFlags::MASK_MOVEMENT,
            async_collision: false,
        }
    }

    /// Enable async collision for this volume.
    pub fn with_async(mut self) -> Self {
        self.async_collision = true;
        self
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.response.is_empty()
    }
}

/// Ordered set of collision volumes with saved default responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollisionVolumeSet {
    volumes: Vec<CollisionVolume>,
    /// Responses captured by `disable_all`, restored by `restore_defaults`.
    defaults: Vec<(VolumeId, ContentFlags)>,
}

impl CollisionVolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set with a single primary volume centered on the root.
    pub fn single(shape: TraceShape) -> Self {
        let mut set = Self::new();
        set.add(CollisionVolume::new(0, shape, Pose::IDENTITY));
        set
    }

    /// Append a volume. The first volume added becomes the primary.
    pub fn add(&mut self, volume: CollisionVolume) {
        self.volumes.push(volume);
    }

    /// Remove a volume by id. Removing the primary promotes the next volume,
    /// or leaves the set without a primary.
    pub fn remove(&mut self, id: VolumeId) -> Option<CollisionVolume> {
        let index = self.volumes.iter().position(|v| v.id == id)?;
        Some(self.volumes.remove(index))
    }

    pub fn primary(&self) -> Option<&CollisionVolume> {
        self.volumes.first()
    }

    pub fn get(&self, index: usize) -> Option<&CollisionVolume> {
        self.volumes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollisionVolume> {
        self.volumes.iter()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Change one volume's collision response.
    pub fn set_response(&mut self, id: VolumeId, response: ContentFlags) -> bool {
        match self.volumes.iter_mut().find(|v| v.id == id) {
            Some(volume) => {
                volume.response = response;
                true
            }
            None => false,
        }
    }

    /// Disable every volume (e.g. on death), remembering current responses.
    ///
    /// Calling this twice keeps the first snapshot.
    pub fn disable_all(&mut self) {
        if self.defaults.is_empty() {
            self.defaults = self.volumes.iter().map(|v| (v.id, v.response)).collect();
        }
        for volume in &mut self.volumes {
            volume.response = ContentFlags::EMPTY;
        }
    }

    /// Restore the responses captured by the last `disable_all`.
    pub fn restore_defaults(&mut self) {
        for (id, response) in std::mem::take(&mut self.defaults) {
            if let Some(volume) = self.volumes.iter_mut().find(|v| v.id == id) {
                volume.response = response;
            }
        }
    }

    /// World pose of the volume at `index` given the entity root pose.
    pub fn world_pose(&self, root: &Pose, index: usize) -> Option<Pose> {
        self.volumes.get(index).map(|v| root.compose(&v.offset))
    }
}
