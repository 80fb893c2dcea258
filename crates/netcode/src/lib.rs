//! Stride Netcode
//!
//! Client prediction and server reconciliation for entities driven by the
//! `stride_physics` movement kernel.
//!
//! # Architecture
//!
//! - **Client**: Predicts every tick, buffers moves until the server
//!   acknowledges them, and replays them after a correction
//! - **Server**: Replays each move, compares it with the client's claim and
//!   decides whether to accept, trust or correct it
//!
//! Both sides run the same deterministic kernel on the same quantized input,
//! so an honest client is never corrected.

pub mod client;
pub mod server;

pub use client::{ClientConfig, ClientPredictor, MoveBuffer, MoveRecord};
pub use server::{Arbiter, ArbiterConfig, AuthorityState, ServerEntity};
