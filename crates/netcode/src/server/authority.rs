//! Per-connection reconciliation state.
//!
//! One [`AuthorityState`] exists per simulated entity and connection. The
//! arbiter is its only writer; it is handed through every call explicitly.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use stride_protocol::Correction;

use super::anticheat::{AntiCheatAction, TimeDiscrepancy};

/// Corrections kept while waiting for the client to acknowledge them.
const MAX_PENDING_CORRECTIONS: usize = 16;

/// Counters describing one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub moves_received: u64,
    pub moves_accepted: u64,
    pub moves_rejected: u64,
    pub duplicate_moves: u64,
    pub corrections_sent: u64,
    pub lenient_accepts: u64,
    pub authority_grants: u64,
    pub forced_grants: u64,
}

impl ConnectionMetrics {
    /// Fraction of processed moves that needed a correction.
    pub fn correction_rate(&self) -> f32 {
        let processed = self.moves_accepted + self.corrections_sent;
        if processed == 0 {
            0.0
        } else {
            self.corrections_sent as f32 / processed as f32
        }
    }
}

/// Server-side trust and bookkeeping for one connection.
#[derive(Debug, Clone, Default)]
pub struct AuthorityState {
    /// Leniency spent recently. Grows on lenient accepts, decays with time.
    trust_budget: f32,
    last_accepted: Option<f64>,
    /// Server time the previous batch arrived.
    last_batch_at: Option<f64>,
    pending_corrections: VecDeque<Correction>,
    time: TimeDiscrepancy,
    sanction: Option<AntiCheatAction>,
    correction_rate_reported: bool,
    pub metrics: ConnectionMetrics,
}

impl AuthorityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return to the freshly-connected state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn trust_budget(&self) -> f32 {
        self.trust_budget
    }

    /// Let `dt` seconds of spent leniency expire.
    pub fn decay(&mut self, dt: f32, rate: f32) {
        self.trust_budget = (self.trust_budget - rate.max(0.0) * dt.max(0.0)).max(0.0);
    }

    /// Spend `cost` of leniency if it fits under `cap`.
    pub fn try_spend(&mut self, cost: f32, cap: f32) -> bool {
        if !cost.is_finite() || cost < 0.0 {
            return false;
        }
        if self.trust_budget + cost > cap {
            return false;
        }
        self.trust_budget += cost;
        true
    }

    #[inline]
    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    pub(crate) fn set_last_accepted(&mut self, timestamp: f64) {
        self.last_accepted = Some(timestamp);
    }

    /// Remember a correction until the client acknowledges it.
    pub fn record_correction(&mut self, correction: Correction) {
        if self.pending_corrections.len() >= MAX_PENDING_CORRECTIONS {
            self.pending_corrections.pop_front();
        }
        self.pending_corrections.push_back(correction);
        self.metrics.corrections_sent += 1;
    }

    /// Forget corrections the client says it has applied.
    pub fn retire_corrections(&mut self, acked: f64) -> usize {
        let before = self.pending_corrections.len();
        self.pending_corrections.retain(|c| c.timestamp > acked);
        before - self.pending_corrections.len()
    }

    /// Newest correction still unacknowledged.
    pub fn pending_correction(&self) -> Option<&Correction> {
        self.pending_corrections.back()
    }

    pub fn pending_corrections(&self) -> usize {
        self.pending_corrections.len()
    }

    /// Server time elapsed since the previous batch, then remember `now`.
    pub(crate) fn batch_interval(&mut self, now: f64) -> Option<f64> {
        let interval = self.last_batch_at.map(|last| now - last);
        self.last_batch_at = Some(now);
        interval
    }

    pub fn time_discrepancy(&self) -> &TimeDiscrepancy {
        &self.time
    }

    pub(crate) fn time_discrepancy_mut(&mut self) -> &mut TimeDiscrepancy {
        &mut self.time
    }

    /// Strongest action taken against this connection so far.
    pub fn sanction(&self) -> Option<AntiCheatAction> {
        self.sanction
    }

    pub(crate) fn escalate(&mut self, action: AntiCheatAction) {
        self.sanction = self.sanction.max(Some(action));
    }

    pub(crate) fn take_correction_rate_report(&mut self) -> bool {
        !std::mem::replace(&mut self.correction_rate_reported, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correction(timestamp: f64) -> Correction {
        Correction {
            timestamp,
            position: [0.0; 3],
            rotation: [0; 3],
            velocity: [0.0; 3],
            mode: 0,
            base: None,
            impulse: None,
        }
    }

    #[test]
    fn test_budget_is_bounded() {
        let mut auth = AuthorityState::new();
        let cap = 5.0;

        let mut spent = 0;
        for _ in 0..100 {
            if auth.try_spend(1.5, cap) {
                spent += 1;
            }
            assert!(auth.trust_budget() <= cap, "budget {} exceeds cap", auth.trust_budget());
        }
        assert_eq!(spent, 3);
        assert!(!auth.try_spend(f32::NAN, cap));
        assert!(!auth.try_spend(-1.0, cap));
    }

    #[test]
    fn test_budget_decays_to_zero() {
        let mut auth = AuthorityState::new();
        assert!(auth.try_spend(4.0, 10.0));

        auth.decay(0.5, 4.0);
        assert!((auth.trust_budget() - 2.0).abs() < 1e-6);

        for _ in 0..10 {
            auth.decay(0.5, 4.0);
        }
        assert_eq!(auth.trust_budget(), 0.0);
    }

    #[test]
    fn test_corrections_retire_on_ack() {
        let mut auth = AuthorityState::new();
        auth.record_correction(correction(1.0));
        auth.record_correction(correction(2.0));
        auth.record_correction(correction(3.0));

        assert_eq!(auth.retire_corrections(2.0), 2);
        assert_eq!(auth.pending_correction().map(|c| c.timestamp), Some(3.0));
        assert_eq!(auth.metrics.corrections_sent, 3);
    }

    #[test]
    fn test_reset_is_deterministic() {
        let mut auth = AuthorityState::new();
        auth.try_spend(1.0, 5.0);
        auth.set_last_accepted(4.0);
        auth.record_correction(correction(4.0));
        auth.escalate(AntiCheatAction::Kick);
        auth.batch_interval(10.0);

        auth.reset();
        assert_eq!(auth.trust_budget(), 0.0);
        assert_eq!(auth.last_accepted(), None);
        assert_eq!(auth.pending_corrections(), 0);
        assert_eq!(auth.sanction(), None);
        assert_eq!(auth.batch_interval(11.0), None);
        assert_eq!(auth.metrics, ConnectionMetrics::default());
    }

    #[test]
    fn test_sanction_only_escalates() {
        let mut auth = AuthorityState::new();
        auth.escalate(AntiCheatAction::Kick);
        auth.escalate(AntiCheatAction::Log);
        assert_eq!(auth.sanction(), Some(AntiCheatAction::Kick));
    }
}
