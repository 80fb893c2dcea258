//! Network protocol for Stride.
//!
//! Defines the moves a client sends, the corrections and acknowledgements a
//! server answers with, and their compact versioned binary encoding.

pub mod codec;
pub mod quantize;
pub mod wire;

pub use codec::*;
pub use quantize::*;
pub use wire::*;
