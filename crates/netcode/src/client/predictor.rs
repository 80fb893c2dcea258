//! Client-side prediction with correction replay.
//!
//! The predictor runs the movement kernel locally every tick, records each
//! move, and batches unsent moves for the server. When a correction arrives
//! it rewinds to the corrected state and replays every move the server has
//! not acknowledged yet.

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use stride_physics::collision::{CollisionVolumeSet, CollisionWorld, SweepConfig, SweepEngine};
use stride_physics::movement::{MoveFlags, MoveInput, MovementKernel, MovementModifiers, MovementState, StepEnv};
use stride_protocol::{quantize_rotation, quantize_unit_vector, Correction, MoveBatch, ServerPacket};

use super::buffer::{BufferConfig, MoveBuffer};
use super::record::record_move;

/// Client prediction tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub buffer: BufferConfig,

    /// Ticks between outgoing batches.
    pub send_interval_ticks: u32,

    /// Allowed ratio between simulated and trusted elapsed time.
    pub clock_tolerance: f64,

    /// Trusted time a clock window must span before it is judged (seconds).
    pub clock_window: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            send_interval_ticks: 2,
            clock_tolerance: 0.05,
            clock_window: 1.0,
        }
    }
}

/// Watches the simulation clock against a trusted wall clock.
///
/// A client whose frame times add up to noticeably more than real time has
/// had its clock sped up. Once seen, the flag stays set.
#[derive(Debug, Clone, Default)]
pub struct ClockMonitor {
    simulated: f64,
    trusted: f64,
    tampered: bool,
}

impl ClockMonitor {
    pub fn add_simulated(&mut self, dt: f32) {
        self.simulated += dt as f64;
    }

    /// Feed trusted elapsed time. Returns `true` if tampering was detected.
    pub fn observe_trusted(&mut self, elapsed: f64, config: &ClientConfig) -> bool {
        self.trusted += elapsed.max(0.0);
        if self.trusted < config.clock_window {
            return false;
        }

        let ratio = self.simulated / self.trusted;
        if ratio > 1.0 + config.clock_tolerance && !self.tampered {
            log::warn!("local clock runs {:.3}x faster than trusted time", ratio);
            self.tampered = true;
        }

        self.simulated = 0.0;
        self.trusted = 0.0;
        self.tampered
    }

    #[inline]
    pub fn tampered(&self) -> bool {
        self.tampered
    }
}

/// Counters for tracking prediction behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetrics {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub moves_combined: u64,
    pub batches_sent: u64,
    pub corrections_applied: u64,
    pub duplicate_corrections: u64,
    pub moves_replayed: u64,
}

/// Round input to wire precision so server replay starts from the same values.
pub fn quantize_input(input: &MoveInput) -> MoveInput {
    MoveInput {
        acceleration: quantize_unit_vector(input.acceleration),
        control_rotation: quantize_rotation(input.control_rotation),
        ..*input
    }
}

/// Locally predicted entity owned by a client.
pub struct ClientPredictor {
    config: ClientConfig,
    kernel: MovementKernel,
    world: Arc<CollisionWorld>,
    volumes: CollisionVolumeSet,
    sweeper: SweepEngine,
    state: MovementState,
    buffer: MoveBuffer,

    clock: f64,
    ticks_since_send: u32,
    clock_monitor: ClockMonitor,

    /// Mark the next move with `EXTERNAL_FORCE`.
    force_requested: bool,

    /// Newest correction applied.
    last_correction: Option<f64>,
    /// Keep telling the server about `last_correction` until it has seen it.
    correction_ack_pending: bool,
    /// Newest move that carried the correction acknowledgement.
    correction_ack_carrier: Option<f64>,

    metrics: PredictionMetrics,
}

impl ClientPredictor {
    pub fn new(
        kernel: MovementKernel,
        world: Arc<CollisionWorld>,
        volumes: CollisionVolumeSet,
        state: MovementState,
        config: ClientConfig,
    ) -> Self {
        Self {
            buffer: MoveBuffer::new(config.buffer.clone()),
            config,
            kernel,
            world,
            volumes,
            sweeper: SweepEngine::new(SweepConfig::default()),
            state,
            clock: 0.0,
            ticks_since_send: 0,
            clock_monitor: ClockMonitor::default(),
            force_requested: false,
            last_correction: None,
            correction_ack_pending: false,
            correction_ack_carrier: None,
            metrics: PredictionMetrics::default(),
        }
    }

    /// Use a custom sweep engine (e.g. one with async secondary volumes).
    pub fn with_sweep_engine(mut self, sweeper: SweepEngine) -> Self {
        self.sweeper = sweeper;
        self
    }

    pub fn state(&self) -> &MovementState {
        &self.state
    }

    pub fn buffer(&self) -> &MoveBuffer {
        &self.buffer
    }

    pub fn metrics(&self) -> &PredictionMetrics {
        &self.metrics
    }

    /// Client time of the newest predicted move.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn volumes_mut(&mut self) -> &mut CollisionVolumeSet {
        &mut self.volumes
    }

    /// Add an external impulse the server applies too (knockback).
    pub fn apply_impulse(&mut self, impulse: Vec3) {
        self.state.impulse += impulse;
    }

    /// Add an impulse only this client knows about (a local launch pad)
    /// and ask the server to adopt it with the next move.
    pub fn request_impulse(&mut self, impulse: Vec3) {
        self.state.impulse += impulse;
        self.force_requested = true;
    }

    /// Report trusted elapsed time to the clock monitor.
    pub fn observe_wall_clock(&mut self, elapsed: f64) -> bool {
        self.clock_monitor.observe_trusted(elapsed, &self.config)
    }

    /// Predict one tick. Returns a batch when one is due.
    pub fn tick(&mut self, input: &MoveInput, dt: f32, modifiers: &dyn MovementModifiers) -> Option<MoveBatch> {
        self.metrics.ticks += 1;

        if self.buffer.is_full() {
            log::warn!("move buffer full ({} moves), skipping tick", self.buffer.len());
            self.metrics.skipped_ticks += 1;
            return None;
        }

        let mut input = quantize_input(input);
        if self.force_requested {
            input.flags.press(MoveFlags::EXTERNAL_FORCE);
        }
        let start_impulse = self.state.impulse;

        self.sweeper.begin_tick();
        let mut env = StepEnv::new(&self.world, &self.volumes, &mut self.sweeper, modifiers);
        let next = match self.kernel.step(&self.state, &input, dt, &mut env) {
            Ok(next) => next,
            Err(abort) => {
                log::debug!("prediction skipped: {}", abort);
                self.metrics.skipped_ticks += 1;
                return None;
            }
        };

        let timestamp = self.clock + dt as f64;
        match self.buffer.push(record_move(timestamp, input, dt, start_impulse, next.clone())) {
            Ok(true) => self.metrics.moves_combined += 1,
            Ok(false) => {}
            Err(err) => {
                log::warn!("dropping predicted move: {}", err);
                self.metrics.skipped_ticks += 1;
                return None;
            }
        }

        self.force_requested = false;
        self.state = next;
        self.clock = timestamp;
        self.clock_monitor.add_simulated(dt);

        self.ticks_since_send += 1;
        if self.ticks_since_send >= self.config.send_interval_ticks.max(1) {
            self.build_batch()
        } else {
            None
        }
    }

    /// Collect unsent moves plus one redundant important move.
    pub fn build_batch(&mut self) -> Option<MoveBatch> {
        self.ticks_since_send = 0;

        let tampered = self.clock_monitor.tampered();
        let redundant = self.buffer.oldest_unacked_important().map(|r| r.to_wire(None, tampered));

        let records = self.buffer.take_unsent();
        let newest = records.last()?.timestamp;

        let acked = if self.correction_ack_pending {
            self.correction_ack_carrier.get_or_insert(newest);
            self.last_correction
        } else {
            None
        };

        let moves = records
            .iter()
            .map(|r| {
                let carries_ack = r.timestamp == newest;
                r.to_wire(if carries_ack { acked } else { None }, tampered)
            })
            .collect();

        self.metrics.batches_sent += 1;
        Some(MoveBatch { redundant, moves })
    }

    /// Handle one server reply.
    pub fn handle_packet(&mut self, packet: &ServerPacket, modifiers: &dyn MovementModifiers) {
        match packet {
            ServerPacket::Ack { timestamp } => self.acknowledge(*timestamp),
            ServerPacket::Correction(correction) => {
                self.apply_correction(correction, modifiers);
            }
        }
    }

    /// The server accepted every move up to `timestamp`.
    pub fn acknowledge(&mut self, timestamp: f64) {
        self.buffer.acknowledge(timestamp);
        if self.correction_ack_carrier.is_some_and(|carrier| timestamp >= carrier) {
            self.correction_ack_pending = false;
            self.correction_ack_carrier = None;
        }
    }

    /// Rewind to `correction` and replay unacknowledged moves.
    ///
    /// Applying the same (or an older) correction again changes nothing.
    /// Returns `true` if the correction was applied.
    pub fn apply_correction(&mut self, correction: &Correction, modifiers: &dyn MovementModifiers) -> bool {
        if self.last_correction.is_some_and(|last| correction.timestamp <= last) {
            self.metrics.duplicate_corrections += 1;
            return false;
        }

        let Some(mode) = correction.mode() else {
            log::warn!("ignoring correction with unknown mode {}", correction.mode);
            return false;
        };

        self.buffer.acknowledge(correction.timestamp);

        let mut state = self.state.clone();
        state.position = correction.position();
        state.rotation = correction.rotation();
        state.velocity = correction.velocity();
        state.mode = mode;
        state.impulse = correction.impulse_override().unwrap_or(Vec3::ZERO);

        self.sweeper.clear_cache();
        let mut env = StepEnv::new(&self.world, &self.volumes, &mut self.sweeper, modifiers);
        self.kernel.refresh_ground(&mut state, &env);

        let mut replayed = 0;
        for record in self.buffer.unacked_mut() {
            env.sweeper.begin_tick();
            if record.input.flags.pressed(MoveFlags::EXTERNAL_FORCE) {
                state.impulse = record.start_impulse;
            } else {
                record.start_impulse = state.impulse;
            }
            match self.kernel.step(&state, &record.input, record.delta_time, &mut env) {
                Ok(next) => {
                    state = next;
                    record.result = state.clone();
                    replayed += 1;
                }
                Err(abort) => {
                    log::debug!("replay stopped at {:.4}: {}", record.timestamp, abort);
                    break;
                }
            }
        }

        log::debug!(
            "applied correction {:.4}, replayed {} moves, error {:.4}",
            correction.timestamp,
            replayed,
            (state.position - self.state.position).length()
        );

        self.state = state;
        self.last_correction = Some(correction.timestamp);
        self.correction_ack_pending = true;
        self.correction_ack_carrier = None;
        self.metrics.corrections_applied += 1;
        self.metrics.moves_replayed += replayed;
        true
    }

    /// Start over after a reconnect.
    pub fn reset(&mut self, state: MovementState) {
        self.buffer.clear();
        self.sweeper.clear_cache();
        self.state = state;
        self.ticks_since_send = 0;
        self.last_correction = None;
        self.correction_ack_pending = false;
        self.correction_ack_carrier = None;
    }
}
