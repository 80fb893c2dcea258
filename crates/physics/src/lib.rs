//! Stride Physics
//!
//! Deterministic movement simulation for player-controlled entities built
//! from several rigid collision volumes. Clients run it to predict their own
//! motion; servers run the same code to replay and verify it.
//!
//! # Architecture
//!
//! The physics crate is split into two main systems:
//!
//! - **Collision**: Traces posed shapes through the world and sweeps whole
//!   multi-volume entities, optionally deferring secondary volumes to workers
//! - **Movement**: Uses the sweep engine to implement mode-based movement
//!
//! # Design Principles
//!
//! 1. **Determinism**: Same inputs always produce same outputs
//! 2. **No partial commits**: A failed step leaves the entity untouched
//! 3. **Shared world**: Geometry is read-only during simulation

pub mod collision;
pub mod movement;

// Re-export commonly used types
pub use collision::{
    CollisionVolume, CollisionVolumeSet, CollisionWorld, ContentFlags, Pose, SweepConfig, SweepEngine,
    TraceResult, TraceShape,
};
pub use movement::{
    MotionMode, MoveFlags, MoveInput, MovementConfig, MovementFlags, MovementKernel, MovementModifiers,
    MovementState, NoModifiers, StepAbort, StepEnv,
};
