//! Server-side reconciliation and authority.
//!
//! # Key Types
//!
//! - [`Arbiter`]: Replays client moves and decides accept or correct
//! - [`AuthorityState`]: Per-connection trust budget and bookkeeping
//! - [`AntiCheatSink`]: Receives statistical cheat reports

mod anticheat;
mod arbiter;
mod authority;

pub use anticheat::{
    correction_rate_signal, suspicion, AntiCheatAction, AntiCheatConfig, AntiCheatEvent, AntiCheatSink, Detection,
    LogSink, PlayerId, RecordingSink, TimeDiscrepancy,
};
pub use arbiter::{Arbiter, ArbiterConfig, AuthorityReason, MoveRejection, MoveVerdict, ServerEntity};
pub use authority::{AuthorityState, ConnectionMetrics};
