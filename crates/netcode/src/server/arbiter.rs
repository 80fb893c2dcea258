//! Server-side move reconciliation.
//!
//! The arbiter replays every client move against the server's own copy of
//! the entity, measures how far the client's claim is from the replay, and
//! decides whether to accept it, trust it, or correct the client.
//!
//! # Decision Order
//!
//! 1. Divergence beyond `large_divergence` always corrects
//! 2. A claimed impulse the server neither shares nor adopts corrects
//! 3. Divergence within `accept_tolerance` (same mode) is accepted
//! 4. Active forced movement trusts the client
//! 5. A validated situational-authority request trusts the client
//! 6. Small divergence is accepted while the trust budget has room
//! 7. Anything else corrects

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stride_physics::collision::{CollisionVolumeSet, CollisionWorld, Pose, SweepConfig, SweepEngine};
use stride_physics::movement::{MoveFlags, MovementKernel, MovementModifiers, MovementState, StepAbort, StepEnv};
use stride_protocol::{
    compress_rotation, decode_batch, decompress_rotation, encode_replies, Correction, MoveBatch, ServerPacket,
    WireMove,
};

use super::anticheat::{correction_rate_signal, suspicion, AntiCheatConfig, AntiCheatEvent, AntiCheatSink, Detection, LogSink, PlayerId};
use super::authority::AuthorityState;

/// Overlap depth at a claimed position that counts as being inside geometry.
const CLAIM_PENETRATION_TOLERANCE: f32 = 0.01;

/// Reconciliation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Longest single move accepted (seconds).
    pub max_move_dt: f32,

    /// Divergence accepted without spending trust.
    pub accept_tolerance: f32,

    /// Divergence that always corrects.
    pub large_divergence: f32,

    /// Largest divergence the trust budget may cover.
    pub leniency_max_error: f32,

    /// Trust budget cap. Lenient accepts cost `error / dt`.
    pub budget_cap: f32,

    /// Trust budget recovered per second.
    pub budget_decay: f32,

    /// Horizontal speed needed before situational authority is granted.
    pub authority_min_speed: f32,

    /// Largest divergence situational authority may cover.
    pub authority_max_error: f32,

    /// Largest residual impulse at which situational authority is still
    /// granted. Knockbacks and launches stay server-driven.
    pub authority_max_impulse: f32,

    /// Difference between the claimed and server impulse treated as equal.
    pub impulse_tolerance: f32,

    /// Largest client-requested impulse the server adopts.
    pub max_requested_impulse: f32,

    /// Move time after which an unacknowledged correction is sent again.
    pub correction_resend_after: f64,

    pub anti_cheat: AntiCheatConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_move_dt: 0.25,
            accept_tolerance: 0.02,
            large_divergence: 3.0,
            leniency_max_error: 0.25,
            budget_cap: 10.0,
            budget_decay: 4.0,
            authority_min_speed: 2.0,
            authority_max_error: 1.0,
            authority_max_impulse: 0.1,
            impulse_tolerance: 0.01,
            max_requested_impulse: 15.0,
            correction_resend_after: 0.2,
            anti_cheat: AntiCheatConfig::default(),
        }
    }
}

impl ArbiterConfig {
    /// Strict settings for competitive play: no leniency, no authority,
    /// no client-requested forces.
    pub fn strict() -> Self {
        Self {
            leniency_max_error: 0.0,
            budget_cap: 0.0,
            authority_max_error: 0.0,
            max_requested_impulse: 0.0,
            ..Default::default()
        }
    }
}

/// Why a move was not processed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MoveRejection {
    #[error("move {timestamp} is not after last accepted move {last}")]
    StaleTimestamp { timestamp: f64, last: f64 },

    #[error("invalid move duration {0}")]
    InvalidDeltaTime(f32),

    #[error("non-finite values in move")]
    NonFinite,

    #[error("unknown motion mode {0}")]
    UnknownMode(u8),

    #[error("replay aborted: {0}")]
    Aborted(#[from] StepAbort),
}

/// Why the client's position was taken over the replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityReason {
    ForcedMovement,
    Situational,
}

/// Outcome of one processed move.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveVerdict {
    /// Replay matched the claim.
    Accepted { error: f32 },
    /// Claim adopted using trust budget.
    Lenient { error: f32, cost: f32 },
    /// Claim adopted without spending budget.
    ClientAuthority { error: f32, reason: AuthorityReason },
    /// Simulated while the client has not yet seen an earlier correction.
    Deferred,
    /// Client must snap to the server state.
    Corrected(Correction),
}

/// The server's copy of a client-controlled entity.
#[derive(Debug)]
pub struct ServerEntity {
    pub player: PlayerId,
    pub state: MovementState,
    pub volumes: CollisionVolumeSet,
    pub sweeper: SweepEngine,
}

impl ServerEntity {
    pub fn new(player: PlayerId, state: MovementState, volumes: CollisionVolumeSet) -> Self {
        Self {
            player,
            state,
            volumes,
            sweeper: SweepEngine::new(SweepConfig::default()),
        }
    }

    /// Add an authoritative external impulse.
    pub fn apply_impulse(&mut self, impulse: Vec3) {
        self.state.impulse += impulse;
    }
}

/// Authoritative move reconciliation for every connection of a server.
///
/// Holds no per-connection state: each call receives the connection's
/// [`ServerEntity`] and [`AuthorityState`].
pub struct Arbiter<S: AntiCheatSink = LogSink> {
    config: ArbiterConfig,
    kernel: MovementKernel,
    world: Arc<CollisionWorld>,
    sink: S,
}

impl Arbiter<LogSink> {
    pub fn new(config: ArbiterConfig, kernel: MovementKernel, world: Arc<CollisionWorld>) -> Self {
        Self::with_sink(config, kernel, world, LogSink)
    }
}

impl<S: AntiCheatSink> Arbiter<S> {
    pub fn with_sink(config: ArbiterConfig, kernel: MovementKernel, world: Arc<CollisionWorld>, sink: S) -> Self {
        Self {
            config,
            kernel,
            world,
            sink,
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn kernel(&self) -> &MovementKernel {
        &self.kernel
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Create the server copy of a new entity standing at `position`.
    pub fn spawn_entity(
        &self,
        player: PlayerId,
        position: Vec3,
        volumes: CollisionVolumeSet,
        modifiers: &dyn MovementModifiers,
    ) -> ServerEntity {
        let mut entity = ServerEntity::new(player, MovementState::new(position), volumes);
        let env = StepEnv::new(&self.world, &entity.volumes, &mut entity.sweeper, modifiers);
        let state = self.kernel.spawn_at(position, &env);
        entity.state = state;
        entity
    }

    // ========================================================================
    // Packets
    // ========================================================================

    /// Decode, process and answer one datagram.
    ///
    /// Malformed packets are dropped. Returns the encoded replies, if any.
    pub fn handle_datagram(
        &mut self,
        entity: &mut ServerEntity,
        auth: &mut AuthorityState,
        data: &[u8],
        received_at: f64,
        modifiers: &dyn MovementModifiers,
    ) -> Option<Vec<u8>> {
        let batch = match decode_batch(data) {
            Ok(batch) => batch,
            Err(err) => {
                log::warn!("player {}: dropping malformed packet: {}", entity.player, err);
                return None;
            }
        };

        let replies = self.process_batch(entity, auth, &batch, received_at, modifiers);
        if replies.is_empty() {
            return None;
        }

        match encode_replies(&replies) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log::warn!("player {}: failed to encode replies: {}", entity.player, err);
                None
            }
        }
    }

    /// Process every move of a batch in order and collect the replies.
    ///
    /// At most one acknowledgement is sent, for the newest accepted move
    /// after the last correction.
    pub fn process_batch(
        &mut self,
        entity: &mut ServerEntity,
        auth: &mut AuthorityState,
        batch: &MoveBatch,
        received_at: f64,
        modifiers: &dyn MovementModifiers,
    ) -> Vec<ServerPacket> {
        let mut replies = Vec::new();
        let mut ack = None;
        let mut claimed = 0.0_f64;
        let mut tampered = false;

        for wire in batch.iter() {
            match self.process_move(entity, auth, wire, modifiers) {
                Ok(verdict) => {
                    claimed += wire.delta_time as f64;
                    tampered |= wire.time_tampered();
                    match verdict {
                        MoveVerdict::Corrected(correction) => {
                            ack = None;
                            replies.push(ServerPacket::Correction(correction));
                        }
                        MoveVerdict::Deferred => {}
                        _ => ack = Some(wire.timestamp),
                    }
                }
                Err(MoveRejection::StaleTimestamp { timestamp, .. }) => {
                    log::trace!("player {}: skipping duplicate move {:.4}", entity.player, timestamp);
                }
                Err(MoveRejection::Aborted(StepAbort::MovementBlocked)) => {
                    claimed += wire.delta_time as f64;
                    ack = None;
                    let correction = self.correct(entity, auth, wire.timestamp);
                    replies.push(ServerPacket::Correction(correction));
                }
                Err(err) => {
                    log::warn!("player {}: rejected move {:.4}: {}", entity.player, wire.timestamp, err);
                }
            }
        }

        if let Some(timestamp) = ack {
            replies.push(ServerPacket::Ack { timestamp });
        }

        self.run_checks(entity.player, auth, claimed, received_at, tampered);
        replies
    }

    // ========================================================================
    // Moves
    // ========================================================================

    /// Validate, replay, compare and decide one move.
    pub fn process_move(
        &mut self,
        entity: &mut ServerEntity,
        auth: &mut AuthorityState,
        wire: &WireMove,
        modifiers: &dyn MovementModifiers,
    ) -> Result<MoveVerdict, MoveRejection> {
        auth.metrics.moves_received += 1;

        if !wire.is_finite() {
            auth.metrics.moves_rejected += 1;
            return Err(MoveRejection::NonFinite);
        }

        if let Some(last) = auth.last_accepted() {
            if wire.timestamp <= last {
                auth.metrics.duplicate_moves += 1;
                return Err(MoveRejection::StaleTimestamp {
                    timestamp: wire.timestamp,
                    last,
                });
            }
        }

        let dt = wire.delta_time;
        if !(dt > 0.0 && dt <= self.config.max_move_dt) {
            auth.metrics.moves_rejected += 1;
            return Err(MoveRejection::InvalidDeltaTime(dt));
        }

        let Some(client_mode) = wire.client_mode() else {
            auth.metrics.moves_rejected += 1;
            return Err(MoveRejection::UnknownMode(wire.client_mode));
        };

        if let Some(acked) = wire.acked_correction {
            auth.retire_corrections(acked);
        }
        auth.decay(dt, self.config.budget_decay);

        let impulse_mismatch = self.reconcile_impulse(entity, wire);
        let start_impulse = entity.state.impulse;

        // Replay
        let input = wire.input();
        entity.sweeper.begin_tick();
        let mut env = StepEnv::new(&self.world, &entity.volumes, &mut entity.sweeper, modifiers);
        let replay = self.kernel.step(&entity.state, &input, dt, &mut env);
        auth.set_last_accepted(wire.timestamp);

        entity.state = match replay {
            Ok(state) => state,
            Err(abort) => {
                auth.metrics.moves_rejected += 1;
                return Err(abort.into());
            }
        };

        // Compare
        let claimed = wire.client_position();
        let error = (claimed - entity.state.position).length();
        let mode_matches = client_mode == entity.state.mode;

        // Decide
        if let Some(pending) = auth.pending_correction().map(|c| c.timestamp) {
            let waited = wire.timestamp - pending;
            if waited < self.config.correction_resend_after && error <= self.config.large_divergence {
                return Ok(MoveVerdict::Deferred);
            }
            log::debug!("player {}: correction {:.4} unacknowledged, resending", entity.player, pending);
            return Ok(MoveVerdict::Corrected(self.correct(entity, auth, wire.timestamp)));
        }

        if error > self.config.large_divergence {
            log::debug!("player {}: large divergence {:.3} at {:.4}", entity.player, error, wire.timestamp);
            return Ok(MoveVerdict::Corrected(self.correct(entity, auth, wire.timestamp)));
        }

        if impulse_mismatch {
            return Ok(MoveVerdict::Corrected(self.correct(entity, auth, wire.timestamp)));
        }

        if mode_matches && error <= self.config.accept_tolerance {
            auth.metrics.moves_accepted += 1;
            return Ok(MoveVerdict::Accepted { error });
        }

        if modifiers.has_forced_movement() && self.claim_is_clear(entity, claimed) {
            self.adopt_claim(entity, claimed, modifiers);
            auth.metrics.moves_accepted += 1;
            auth.metrics.forced_grants += 1;
            return Ok(MoveVerdict::ClientAuthority {
                error,
                reason: AuthorityReason::ForcedMovement,
            });
        }

        if wire.wants_authority() && self.situational_authority(entity, start_impulse, error, claimed) {
            self.adopt_claim(entity, claimed, modifiers);
            auth.metrics.moves_accepted += 1;
            auth.metrics.authority_grants += 1;
            return Ok(MoveVerdict::ClientAuthority {
                error,
                reason: AuthorityReason::Situational,
            });
        }

        if mode_matches && error <= self.config.leniency_max_error && self.claim_is_clear(entity, claimed) {
            let cost = error / dt;
            if auth.try_spend(cost, self.config.budget_cap) {
                log::debug!(
                    "player {}: lenient accept error {:.3}, budget {:.2}/{:.2}",
                    entity.player,
                    error,
                    auth.trust_budget(),
                    self.config.budget_cap
                );
                self.adopt_claim(entity, claimed, modifiers);
                auth.metrics.moves_accepted += 1;
                auth.metrics.lenient_accepts += 1;
                return Ok(MoveVerdict::Lenient { error, cost });
            }
        }

        Ok(MoveVerdict::Corrected(self.correct(entity, auth, wire.timestamp)))
    }

    /// Situational authority: fast-moving entity, no external impulse in
    /// play, bounded error, clear spot.
    fn situational_authority(&self, entity: &ServerEntity, start_impulse: Vec3, error: f32, claimed: Vec3) -> bool {
        let impulse = start_impulse.length().max(entity.state.impulse.length());
        entity.state.horizontal_speed() >= self.config.authority_min_speed
            && impulse <= self.config.authority_max_impulse
            && error <= self.config.authority_max_error
            && self.claim_is_clear(entity, claimed)
    }

    /// Settle the impulse the move starts from. Returns `true` when the
    /// client's claimed impulse is rejected and must be corrected.
    ///
    /// A claim matching the server is taken as is. A differing claim is
    /// adopted only when the move requests it with `EXTERNAL_FORCE` and its
    /// magnitude is within `max_requested_impulse`. Otherwise the replay
    /// keeps the server's impulse.
    fn reconcile_impulse(&self, entity: &mut ServerEntity, wire: &WireMove) -> bool {
        let claimed = wire.impulse();
        let drift = (claimed - entity.state.impulse).length();
        let requested = wire.input().flags.pressed(MoveFlags::EXTERNAL_FORCE);

        if drift <= self.config.impulse_tolerance {
            if requested {
                entity.state.impulse = claimed;
            }
            return false;
        }

        if requested && claimed.length() <= self.config.max_requested_impulse {
            log::debug!(
                "player {}: adopting requested impulse {:?} at {:.4}",
                entity.player,
                claimed,
                wire.timestamp
            );
            entity.state.impulse = claimed;
            return false;
        }

        log::debug!(
            "player {}: claimed impulse {:?} disagrees with {:?} at {:.4}",
            entity.player,
            claimed,
            entity.state.impulse,
            wire.timestamp
        );
        true
    }

    /// Whether the primary volume fits at the claimed position.
    fn claim_is_clear(&self, entity: &ServerEntity, claimed: Vec3) -> bool {
        let Some(primary) = entity.volumes.primary() else {
            return false;
        };
        let pose = Pose::new(claimed, entity.state.rotation).compose(&primary.offset);
        self.world
            .deepest_overlap(&pose, primary.shape, self.kernel.config.collision_mask)
            .map_or(true, |o| o.depth <= CLAIM_PENETRATION_TOLERANCE)
    }

    fn adopt_claim(&self, entity: &mut ServerEntity, claimed: Vec3, modifiers: &dyn MovementModifiers) {
        entity.state.position = claimed;
        entity.sweeper.clear_cache();
        let env = StepEnv::new(&self.world, &entity.volumes, &mut entity.sweeper, modifiers);
        self.kernel.refresh_ground(&mut entity.state, &env);
    }

    /// Build a correction from the server state and remember it.
    fn correct(&self, entity: &mut ServerEntity, auth: &mut AuthorityState, timestamp: f64) -> Correction {
        // The client only ever sees the quantized rotation.
        let rotation = compress_rotation(entity.state.rotation);
        entity.state.rotation = decompress_rotation(rotation);

        let state = &entity.state;
        let correction = Correction {
            timestamp,
            position: state.position.to_array(),
            rotation,
            velocity: state.velocity.to_array(),
            mode: state.mode.pack(),
            base: state.ground.and_then(|g| g.object),
            impulse: (state.impulse != Vec3::ZERO).then(|| state.impulse.to_array()),
        };

        auth.record_correction(correction.clone());
        correction
    }

    // ========================================================================
    // Anti-cheat
    // ========================================================================

    fn run_checks(&mut self, player: PlayerId, auth: &mut AuthorityState, claimed: f64, received_at: f64, tampered: bool) {
        let config = self.config.anti_cheat.clone();

        if let Some(observed) = auth.batch_interval(received_at) {
            if let Some(excess) = auth.time_discrepancy_mut().observe(claimed, observed, &config) {
                self.report(player, auth, Detection::TimeDiscrepancy { excess });
            }
        }

        if tampered && config.report_client_tamper {
            self.report(player, auth, Detection::ClientTamper);
        }

        let rate = auth.metrics.correction_rate();
        if auth.metrics.moves_received >= config.correction_rate_min_moves
            && rate > config.correction_rate_threshold
            && auth.take_correction_rate_report()
        {
            self.report(player, auth, Detection::CorrectionRate { rate });
        }
    }

    fn report(&mut self, player: PlayerId, auth: &mut AuthorityState, detection: Detection) {
        let config = &self.config.anti_cheat;
        let detection_signal = match detection {
            Detection::TimeDiscrepancy { .. } => 0.8,
            Detection::ClientTamper => 0.9,
            Detection::CorrectionRate { .. } => 0.0,
        };
        let probability = suspicion(&[
            detection_signal,
            correction_rate_signal(auth.metrics.correction_rate(), config),
            auth.time_discrepancy().pressure(config),
        ]);

        let action = config.action;
        auth.escalate(action);
        self.sink.report(AntiCheatEvent {
            player,
            detection,
            metrics: auth.metrics,
            probability,
            action,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::anticheat::{AntiCheatAction, RecordingSink};
    use glam::Quat;
    use stride_physics::collision::{ContentFlags, TraceShape};
    use stride_physics::movement::{ModifierTable, MotionMode, MoveInput, NoModifiers};
    use stride_protocol::{compress_unit_vector, encode_batch, ControlBits};

    const DT: f32 = 1.0 / 60.0;

    struct Rig {
        arbiter: Arbiter<RecordingSink>,
        entity: ServerEntity,
        auth: AuthorityState,
        clock: f64,
    }

    impl Rig {
        fn new(config: ArbiterConfig) -> Self {
            let mut world = CollisionWorld::new();
            world.add_box(Vec3::new(0.0, -0.5, 0.0), Vec3::new(100.0, 0.5, 100.0), ContentFlags::SOLID);
            let arbiter = Arbiter::with_sink(config, MovementKernel::default(), Arc::new(world), RecordingSink::default());
            let entity = ServerEntity::new(
                7,
                MovementState::grounded(Vec3::new(0.0, 0.9, 0.0)),
                CollisionVolumeSet::single(TraceShape::HUMANOID),
            );
            Self {
                arbiter,
                entity,
                auth: AuthorityState::new(),
                clock: 0.0,
            }
        }

        /// A move whose claimed position is exactly what the server will compute.
        fn honest(&mut self, input: &MoveInput) -> WireMove {
            let impulse = self.entity.state.impulse;
            self.claim(input, impulse)
        }

        /// A move simulated from the server state with `impulse` in place of
        /// the server's impulse.
        fn claim(&mut self, input: &MoveInput, impulse: Vec3) -> WireMove {
            self.clock += DT as f64;
            let mut control = ControlBits::default();
            control.set(ControlBits::AUTHORITY_REQUEST, input.flags.pressed(MoveFlags::WANTS_AUTHORITY));
            let mut wire = WireMove {
                timestamp: self.clock,
                delta_time: DT,
                acceleration: compress_unit_vector(input.acceleration),
                flags: input.flags.0 & !MoveFlags::WANTS_AUTHORITY,
                control,
                rotation: compress_rotation(input.control_rotation),
                client_position: [0.0; 3],
                client_mode: 0,
                impulse: (impulse != Vec3::ZERO).then(|| impulse.to_array()),
                acked_correction: None,
            };

            let mut start = self.entity.state.clone();
            start.impulse = impulse;
            let mut sweeper = SweepEngine::new(SweepConfig::default());
            let mut env = StepEnv::new(&self.arbiter.world, &self.entity.volumes, &mut sweeper, &NoModifiers);
            let next = self.arbiter.kernel.step(&start, &wire.input(), DT, &mut env).unwrap();
            wire.client_position = next.position.to_array();
            wire.client_mode = next.mode.pack();
            wire
        }

        fn offset(&mut self, input: &MoveInput, offset: Vec3) -> WireMove {
            let mut wire = self.honest(input);
            wire.client_position = (wire.client_position() + offset).to_array();
            wire
        }

        fn process(&mut self, wire: &WireMove, modifiers: &dyn MovementModifiers) -> Result<MoveVerdict, MoveRejection> {
            self.arbiter.process_move(&mut self.entity, &mut self.auth, wire, modifiers)
        }
    }

    fn run() -> MoveInput {
        MoveInput::new(Vec3::X, Quat::IDENTITY, MoveFlags::default().with(MoveFlags::SPRINT))
    }

    #[test]
    fn test_honest_move_accepted() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let wire = rig.honest(&run());
        assert!(matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Accepted { .. })));
        assert_eq!(rig.auth.last_accepted(), Some(wire.timestamp));
    }

    #[test]
    fn test_stale_and_duplicate_moves_rejected() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let wire = rig.honest(&run());
        rig.process(&wire, &NoModifiers).unwrap();

        let result = rig.process(&wire, &NoModifiers);
        assert!(matches!(result, Err(MoveRejection::StaleTimestamp { .. })));

        let mut older = wire.clone();
        older.timestamp -= 0.5;
        assert!(matches!(rig.process(&older, &NoModifiers), Err(MoveRejection::StaleTimestamp { .. })));
        assert_eq!(rig.auth.metrics.duplicate_moves, 2);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let mut wire = rig.honest(&run());
        wire.delta_time = 2.0;
        assert_eq!(rig.process(&wire, &NoModifiers), Err(MoveRejection::InvalidDeltaTime(2.0)));

        wire.delta_time = 0.0;
        assert_eq!(rig.process(&wire, &NoModifiers), Err(MoveRejection::InvalidDeltaTime(0.0)));
        assert_eq!(rig.auth.last_accepted(), None, "rejected moves do not advance time");
    }

    #[test]
    fn test_large_divergence_beats_forced_movement() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let forced = ModifierTable {
            forced_movement: true,
            ..Default::default()
        };

        let wire = rig.offset(&run(), Vec3::new(5.0, 0.0, 0.0));
        let verdict = rig.process(&wire, &forced).unwrap();
        assert!(matches!(verdict, MoveVerdict::Corrected(_)), "got {:?}", verdict);
    }

    #[test]
    fn test_forced_movement_trusts_client() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let forced = ModifierTable {
            forced_movement: true,
            ..Default::default()
        };

        let wire = rig.offset(&run(), Vec3::new(1.0, 0.0, 0.0));
        let verdict = rig.process(&wire, &forced).unwrap();
        assert!(matches!(
            verdict,
            MoveVerdict::ClientAuthority {
                reason: AuthorityReason::ForcedMovement,
                ..
            }
        ));
        assert_eq!(rig.entity.state.position, wire.client_position());
    }

    #[test]
    fn test_situational_authority_needs_speed() {
        let mut input = MoveInput::default();
        input.flags.press(MoveFlags::WANTS_AUTHORITY);

        // Standing still: not granted, falls through to a correction.
        let mut rig = Rig::new(ArbiterConfig::default());
        let wire = rig.offset(&input, Vec3::new(0.5, 0.0, 0.0));
        let verdict = rig.process(&wire, &NoModifiers).unwrap();
        assert!(matches!(verdict, MoveVerdict::Corrected(_)), "got {:?}", verdict);
        assert_eq!(rig.auth.metrics.authority_grants, 0);

        // Running: granted.
        let mut rig = Rig::new(ArbiterConfig::default());
        rig.entity.state.velocity = Vec3::new(6.0, 0.0, 0.0);
        let mut fast = run();
        fast.flags.press(MoveFlags::WANTS_AUTHORITY);
        let wire = rig.offset(&fast, Vec3::new(0.5, 0.0, 0.0));
        let verdict = rig.process(&wire, &NoModifiers).unwrap();
        assert!(matches!(
            verdict,
            MoveVerdict::ClientAuthority {
                reason: AuthorityReason::Situational,
                ..
            }
        ));
    }

    #[test]
    fn test_situational_authority_refused_during_impulse() {
        let mut rig = Rig::new(ArbiterConfig::default());
        rig.entity.state.velocity = Vec3::new(6.0, 0.0, 0.0);
        rig.entity.state.impulse = Vec3::new(0.0, 0.0, 8.0);

        let mut fast = run();
        fast.flags.press(MoveFlags::WANTS_AUTHORITY);
        let wire = rig.offset(&fast, Vec3::new(0.5, 0.0, 0.0));
        assert_eq!(wire.impulse, Some([0.0, 0.0, 8.0]), "claim carries the shared knockback");

        let verdict = rig.process(&wire, &NoModifiers).unwrap();
        assert!(
            !matches!(
                verdict,
                MoveVerdict::ClientAuthority {
                    reason: AuthorityReason::Situational,
                    ..
                }
            ),
            "got {:?}",
            verdict
        );
        assert_eq!(rig.auth.metrics.authority_grants, 0);
    }

    #[test]
    fn test_shared_impulse_accepted() {
        let mut rig = Rig::new(ArbiterConfig::default());
        rig.entity.apply_impulse(Vec3::new(0.0, 0.0, 5.0));

        let wire = rig.honest(&run());
        assert!(matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Accepted { .. })));
        assert!(rig.entity.state.impulse.z > 0.0);
    }

    #[test]
    fn test_requested_impulse_adopted_within_limit() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let push = MoveInput::new(Vec3::X, Quat::IDENTITY, MoveFlags::default().with(MoveFlags::EXTERNAL_FORCE));

        let wire = rig.claim(&push, Vec3::new(0.0, 0.0, 6.0));
        let verdict = rig.process(&wire, &NoModifiers).unwrap();
        assert!(matches!(verdict, MoveVerdict::Accepted { .. }), "got {:?}", verdict);
        assert!(rig.entity.state.impulse.z > 0.0, "server carries the adopted impulse");

        // Too strong to take on the client's word.
        let mut rig = Rig::new(ArbiterConfig::default());
        let wire = rig.claim(&push, Vec3::new(0.0, 0.0, 20.0));
        let Ok(MoveVerdict::Corrected(correction)) = rig.process(&wire, &NoModifiers) else {
            panic!("expected a correction");
        };
        assert_eq!(correction.impulse, None, "server has no impulse to hand back");
        assert_eq!(rig.entity.state.impulse, Vec3::ZERO);
    }

    #[test]
    fn test_unrequested_impulse_corrected() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let wire = rig.claim(&run(), Vec3::new(0.0, 0.0, 6.0));
        let verdict = rig.process(&wire, &NoModifiers).unwrap();
        assert!(matches!(verdict, MoveVerdict::Corrected(_)), "got {:?}", verdict);
        assert_eq!(rig.entity.state.impulse, Vec3::ZERO, "replay keeps the server impulse");

        // Strict servers never adopt a client force.
        let mut rig = Rig::new(ArbiterConfig::strict());
        let push = MoveInput::new(Vec3::X, Quat::IDENTITY, MoveFlags::default().with(MoveFlags::EXTERNAL_FORCE));
        let wire = rig.claim(&push, Vec3::new(0.0, 0.0, 6.0));
        assert!(matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Corrected(_))));
    }

    #[test]
    fn test_budget_covers_small_errors_until_exhausted() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let input = run();

        let wire = rig.offset(&input, Vec3::new(0.1, 0.0, 0.0));
        assert!(matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Lenient { .. })));
        assert_eq!(rig.entity.state.position, wire.client_position(), "lenient accept adopts the claim");

        let wire = rig.offset(&input, Vec3::new(0.1, 0.0, 0.0));
        assert!(matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Corrected(_))));
        assert!(rig.auth.trust_budget() <= rig.arbiter.config().budget_cap);
    }

    #[test]
    fn test_moves_after_correction_deferred_until_acked() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let input = run();

        let wire = rig.offset(&input, Vec3::new(0.0, 0.0, 2.0));
        let Ok(MoveVerdict::Corrected(correction)) = rig.process(&wire, &NoModifiers) else {
            panic!("expected a correction");
        };

        // Client has not seen it yet: its claims are ignored.
        let wire = rig.offset(&input, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Deferred));

        // Acknowledged: normal comparison resumes.
        let mut wire = rig.honest(&input);
        wire.acked_correction = Some(correction.timestamp);
        assert!(matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Accepted { .. })));
        assert_eq!(rig.auth.pending_corrections(), 0);
    }

    #[test]
    fn test_unacknowledged_correction_is_resent() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let input = run();

        let wire = rig.offset(&input, Vec3::new(0.0, 0.0, 2.0));
        rig.process(&wire, &NoModifiers).unwrap();

        let mut resent = false;
        for _ in 0..20 {
            let wire = rig.offset(&input, Vec3::new(0.0, 0.0, 2.0));
            if matches!(rig.process(&wire, &NoModifiers), Ok(MoveVerdict::Corrected(_))) {
                resent = true;
                break;
            }
        }
        assert!(resent, "a lost correction must eventually be repeated");
    }

    #[test]
    fn test_blocked_movement_corrects_with_unchanged_state() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let dead = ModifierTable {
            movement_blocked: true,
            ..Default::default()
        };
        let before = rig.entity.state.position;

        let wire = rig.offset(&run(), Vec3::X);
        let batch = MoveBatch {
            redundant: None,
            moves: vec![wire],
        };
        let replies = rig.arbiter.process_batch(&mut rig.entity, &mut rig.auth, &batch, 0.0, &dead);

        assert_eq!(replies.len(), 1);
        let ServerPacket::Correction(correction) = &replies[0] else {
            panic!("expected a correction");
        };
        assert_eq!(correction.position(), before);
        assert_eq!(correction.mode(), Some(MotionMode::Grounded));
    }

    #[test]
    fn test_batch_acks_newest_and_skips_redundant_copy() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let input = run();
        let first = rig.honest(&input);
        rig.process(&first, &NoModifiers).unwrap();

        let second = rig.honest(&input);
        let batch = MoveBatch {
            redundant: Some(first),
            moves: vec![second.clone()],
        };
        let replies = rig.arbiter.process_batch(&mut rig.entity, &mut rig.auth, &batch, 0.1, &NoModifiers);
        assert_eq!(replies, vec![ServerPacket::Ack {
            timestamp: second.timestamp
        }]);
    }

    #[test]
    fn test_speed_hack_reported() {
        let mut config = ArbiterConfig::default();
        config.anti_cheat.action = AntiCheatAction::Kick;
        let mut rig = Rig::new(config);
        let input = run();

        // Every batch claims two ticks of time but arrives one tick apart.
        let mut now = 0.0;
        for _ in 0..200 {
            let moves = vec![rig.honest(&input), rig.honest(&input)];
            let batch = MoveBatch { redundant: None, moves };
            rig.arbiter.process_batch(&mut rig.entity, &mut rig.auth, &batch, now, &NoModifiers);
            now += DT as f64;
        }

        let events = &rig.arbiter.sink().events;
        assert!(events
            .iter()
            .any(|e| matches!(e.detection, Detection::TimeDiscrepancy { .. }) && e.player == 7));
        assert!(events.iter().all(|e| (0.0..=1.0).contains(&e.probability)));
        assert_eq!(rig.auth.sanction(), Some(AntiCheatAction::Kick));
    }

    #[test]
    fn test_malformed_datagram_dropped() {
        let mut rig = Rig::new(ArbiterConfig::default());
        let reply = rig
            .arbiter
            .handle_datagram(&mut rig.entity, &mut rig.auth, &[0xFF, 0x00, 0x13], 0.0, &NoModifiers);
        assert!(reply.is_none());
        assert_eq!(rig.auth.metrics.moves_received, 0);

        let wire = rig.honest(&run());
        let data = encode_batch(&MoveBatch {
            redundant: None,
            moves: vec![wire],
        })
        .unwrap();
        let reply = rig
            .arbiter
            .handle_datagram(&mut rig.entity, &mut rig.auth, &data, 0.0, &NoModifiers);
        assert!(reply.is_some());
    }
}
