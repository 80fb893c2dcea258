//! Client-side move prediction.
//!
//! # Key Types
//!
//! - [`MoveRecord`]: One predicted step, ready to send or replay
//! - [`MoveBuffer`]: Bounded history of unacknowledged moves
//! - [`ClientPredictor`]: Runs the kernel locally and applies corrections

mod buffer;
mod predictor;
mod record;

pub use buffer::{BufferConfig, BufferError, MoveBuffer, DEFAULT_BUFFER_CAPACITY};
pub use predictor::{quantize_input, ClientConfig, ClientPredictor, ClockMonitor, PredictionMetrics};
pub use record::{is_important, record_move, try_combine, MoveRecord};
