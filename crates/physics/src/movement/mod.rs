//! Entity movement simulation.
//!
//! This module implements mode-based movement with:
//!
//! - Grounded, falling, swimming, flying, maneuvering, incapacitated and
//!   root-motion modes behind one integrator table
//! - Friction, braking and acceleration models with speed caps
//! - Jumping and stair stepping
//! - Multi-plane collision sliding for multi-volume entities
//!
//! # Design
//!
//! Movement is driven by the [`MovementKernel`], which takes a state and a
//! [`MoveInput`] and returns the next [`MovementState`] through the sweep
//! engine.
//!
//! All movement is deterministic: the same state, input and elapsed time
//! always produce the same result, which lets a server replay client moves.

mod config;
mod input;
mod kernel;
mod modes;
mod modifiers;
mod slide_move;
mod state;
mod velocity;

pub use config::{ModeParams, MovementConfig};
pub use input::{MoveFlags, MoveInput};
pub use kernel::{MovementKernel, StepAbort, StepEnv, Substep};
pub use modes::{integrate, Integrator, MotionMode};
pub use modifiers::{ModifierKey, ModifierTable, MovementModifiers, NoModifiers, RootMotionStep};
pub use slide_move::clip_velocity;
pub use state::{GroundInfo, MovementFlags, MovementState};
pub use velocity::{apply_braking, calc_velocity, resolve_limits, SpeedLimits};
