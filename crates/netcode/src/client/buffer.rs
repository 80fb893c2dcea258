//! Bounded history of unacknowledged client moves.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::{is_important, try_combine, MoveRecord};

/// Default number of unacknowledged moves a client may hold.
pub const DEFAULT_BUFFER_CAPACITY: usize = 384;

/// Move buffer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum unacknowledged moves.
    pub capacity: usize,

    /// Longest move a combine may produce (seconds).
    pub max_combined_dt: f32,

    /// Position slack allowed when combining two moves.
    pub combine_position_tolerance: f32,

    /// Velocity slack allowed when combining two moves.
    pub combine_velocity_tolerance: f32,

    /// Impulse magnitude change that makes a move important.
    pub important_impulse_magnitude: f32,

    /// Impulse direction change (radians) that makes a move important.
    pub important_impulse_angle: f32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            max_combined_dt: 0.1,
            combine_position_tolerance: 0.01,
            combine_velocity_tolerance: 0.05,
            important_impulse_magnitude: 0.5,
            important_impulse_angle: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BufferError {
    #[error("move buffer is full ({0} unacknowledged moves)")]
    Full(usize),

    #[error("move timestamp {timestamp} is not after {last}")]
    StaleTimestamp { timestamp: f64, last: f64 },
}

/// Client-side history of moves the server has not acknowledged yet.
///
/// Records are kept in strictly increasing timestamp order. Nothing is
/// dropped until the server acknowledges it.
#[derive(Debug, Clone, Default)]
pub struct MoveBuffer {
    config: BufferConfig,
    records: VecDeque<MoveRecord>,
    last_acked: Option<MoveRecord>,
}

impl MoveBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            records: VecDeque::with_capacity(config.capacity.min(DEFAULT_BUFFER_CAPACITY)),
            config,
            last_acked: None,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Append a move, merging it into the newest unsent one when possible.
    ///
    /// Returns `true` when the record was combined.
    pub fn push(&mut self, record: MoveRecord) -> Result<bool, BufferError> {
        if let Some(last) = self.newest_timestamp() {
            if record.timestamp <= last {
                return Err(BufferError::StaleTimestamp {
                    timestamp: record.timestamp,
                    last,
                });
            }
        }

        if let Some(prev) = self.records.back_mut() {
            if try_combine(prev, &record, &self.config) {
                return Ok(true);
            }
        }

        if self.is_full() {
            return Err(BufferError::Full(self.records.len()));
        }

        self.records.push_back(record);
        Ok(false)
    }

    /// Drop every move up to and including `timestamp`.
    ///
    /// Returns how many records were retired.
    pub fn acknowledge(&mut self, timestamp: f64) -> usize {
        let mut retired = 0;
        while self.records.front().is_some_and(|r| r.timestamp <= timestamp) {
            self.last_acked = self.records.pop_front();
            retired += 1;
        }
        retired
    }

    /// Unacknowledged moves, oldest first.
    pub fn unacked(&self) -> impl Iterator<Item = &MoveRecord> {
        self.records.iter()
    }

    /// Mutable access for replaying moves after a correction.
    pub fn unacked_mut(&mut self) -> impl Iterator<Item = &mut MoveRecord> {
        self.records.iter_mut()
    }

    /// Moves not yet handed to the transport. They are marked sent.
    pub fn take_unsent(&mut self) -> Vec<MoveRecord> {
        self.records
            .iter_mut()
            .filter(|r| !r.sent)
            .map(|r| {
                r.sent = true;
                r.clone()
            })
            .collect()
    }

    /// Oldest already-sent move that would matter if its packet was lost.
    pub fn oldest_unacked_important(&self) -> Option<&MoveRecord> {
        self.records
            .iter()
            .filter(|r| r.sent)
            .find(|r| is_important(r, self.last_acked.as_ref(), &self.config))
    }

    pub fn last_acked(&self) -> Option<&MoveRecord> {
        self.last_acked.as_ref()
    }

    /// Timestamp of the newest move ever pushed, acknowledged or not.
    pub fn newest_timestamp(&self) -> Option<f64> {
        self.records
            .back()
            .or(self.last_acked.as_ref())
            .map(|r| r.timestamp)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.config.capacity
    }

    /// Forget everything (e.g. on reconnect).
    pub fn clear(&mut self) {
        self.records.clear();
        self.last_acked = None;
    }
}
