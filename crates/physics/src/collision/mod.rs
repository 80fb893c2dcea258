//! Collision detection for movable multi-volume entities.
//!
//! # Key Types
//!
//! - [`CollisionWorld`]: The collision environment containing all geometry
//! - [`CollisionVolumeSet`]: The rigid volumes an entity is made of
//! - [`SweepEngine`]: Moves every volume of an entity as one body
//! - [`AsyncSweeper`]: Worker pool for deferred secondary-volume sweeps
//!
//! # Tracing Algorithm
//!
//! Traces sweep a posed shape through the world and return:
//! - How far the shape traveled (fraction 0.0-1.0)
//! - The last clear pose
//! - Surface normal and penetration depth at impact (if any)
//! - The object and content flags of what was hit

mod async_sweep;
mod flags;
mod sweep;
mod trace;
mod volumes;
mod world;

pub use async_sweep::{AsyncSweeper, SweepHandle, SweepQuery, SweepQueueError};
pub use flags::ContentFlags;
pub use sweep::{SweepConfig, SweepContext, SweepEngine, SweepHit, SweepOutcome};
pub use trace::{ObjectId, Overlap, Pose, TraceResult, TraceShape};
pub use volumes::{CollisionVolume, CollisionVolumeSet, VolumeId};
pub use world::{CollisionObject, CollisionWorld};
