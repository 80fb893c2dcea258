//! Statistical cheat detection layered over reconciliation.
//!
//! Detections never touch the simulation. They are scored, reported to an
//! [`AntiCheatSink`] and turned into the configured [`AntiCheatAction`].

use serde::{Deserialize, Serialize};

use super::authority::ConnectionMetrics;

/// Stable identity of the player behind a connection.
pub type PlayerId = u64;

/// What to do about a detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AntiCheatAction {
    #[default]
    Log,
    Kick,
    Ban,
}

/// Anti-cheat tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCheatConfig {
    pub action: AntiCheatAction,

    /// Excess client time (seconds) that counts as a speed-up.
    pub time_discrepancy_threshold: f64,

    /// Excess forgiven per second of observed time.
    pub time_discrepancy_decay: f64,

    /// Observed time (seconds) a clock window must span before its ratio is
    /// judged.
    pub time_discrepancy_window: f64,

    /// Fraction of moves corrected that looks suspicious.
    pub correction_rate_threshold: f32,

    /// Moves needed before the correction rate is judged.
    pub correction_rate_min_moves: u64,

    /// Report moves carrying the client's own tamper bit.
    pub report_client_tamper: bool,
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            action: AntiCheatAction::Log,
            time_discrepancy_threshold: 0.25,
            time_discrepancy_decay: 0.02,
            time_discrepancy_window: 1.0,
            correction_rate_threshold: 0.5,
            correction_rate_min_moves: 120,
            report_client_tamper: true,
        }
    }
}

/// Why a report was raised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Detection {
    /// Client claimed more elapsed time than the server observed.
    TimeDiscrepancy { excess: f64 },
    /// Client's own clock monitor flagged tampering.
    ClientTamper,
    /// Too many of the client's moves needed correcting.
    CorrectionRate { rate: f32 },
}

/// One report for the anti-cheat side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiCheatEvent {
    pub player: PlayerId,
    pub detection: Detection,
    pub metrics: ConnectionMetrics,
    /// Estimated probability (0..=1) that the player is cheating.
    pub probability: f32,
    pub action: AntiCheatAction,
}

/// Receiver for anti-cheat reports. Fire and forget.
pub trait AntiCheatSink {
    fn report(&mut self, event: AntiCheatEvent);
}

/// Writes reports to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AntiCheatSink for LogSink {
    fn report(&mut self, event: AntiCheatEvent) {
        log::warn!(
            "anti-cheat: player {} {:?} (p={:.2}, action {:?})",
            event.player,
            event.detection,
            event.probability,
            event.action
        );
    }
}

/// Keeps every report in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub events: Vec<AntiCheatEvent>,
}

impl AntiCheatSink for RecordingSink {
    fn report(&mut self, event: AntiCheatEvent) {
        self.events.push(event);
    }
}

// ============================================================================
// Time Discrepancy
// ============================================================================

/// Tracks the ratio of client-claimed to server-observed elapsed time.
///
/// Batches are gathered into windows of at least `time_discrepancy_window`
/// observed seconds. Each window adds `(ratio - 1) * observed` to the
/// excess, so bursts after a stall cancel out inside their window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeDiscrepancy {
    /// Unexplained client time (seconds), never negative.
    pub excess: f64,
    pub detections: u32,
    window_claimed: f64,
    window_observed: f64,
}

impl TimeDiscrepancy {
    /// Fold in one batch. Returns the excess when it crosses the threshold.
    pub fn observe(&mut self, claimed: f64, observed: f64, config: &AntiCheatConfig) -> Option<f64> {
        if !claimed.is_finite() || !observed.is_finite() {
            return None;
        }

        self.window_claimed += claimed.max(0.0);
        self.window_observed += observed.max(0.0);
        if self.window_observed < config.time_discrepancy_window || self.window_observed <= 0.0 {
            return None;
        }

        let observed = self.window_observed;
        let ratio = self.window_claimed / observed;
        self.window_claimed = 0.0;
        self.window_observed = 0.0;

        self.excess += (ratio - 1.0) * observed;
        self.excess -= config.time_discrepancy_decay * observed;
        self.excess = self.excess.max(0.0);

        if self.excess > config.time_discrepancy_threshold {
            let excess = self.excess;
            self.excess = 0.0;
            self.detections += 1;
            Some(excess)
        } else {
            None
        }
    }

    /// How close the connection is to a detection, 0..=1.
    pub fn pressure(&self, config: &AntiCheatConfig) -> f32 {
        if config.time_discrepancy_threshold <= 0.0 {
            return 1.0;
        }
        (self.excess / config.time_discrepancy_threshold).clamp(0.0, 1.0) as f32
    }
}

/// Combine independent signals into one probability.
pub fn suspicion(signals: &[f32]) -> f32 {
    let clean: f32 = signals.iter().map(|p| 1.0 - p.clamp(0.0, 1.0)).product();
    1.0 - clean
}

/// Probability contribution of a correction rate.
pub fn correction_rate_signal(rate: f32, config: &AntiCheatConfig) -> f32 {
    let threshold = config.correction_rate_threshold.clamp(0.0, 0.999);
    ((rate - threshold) / (1.0 - threshold)).clamp(0.0, 1.0)
}
