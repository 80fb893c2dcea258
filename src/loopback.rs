//! In-process client/server loop over a simulated network.
//!
//! The client predicts every tick and the server reconciles whatever
//! datagrams survive the link. Both ends share one arena.

use std::sync::Arc;

use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use stride_netcode::client::{ClientPredictor, PredictionMetrics};
use stride_netcode::server::{
    AntiCheatAction, Arbiter, AuthorityState, ConnectionMetrics, Detection, RecordingSink, ServerEntity,
};
use stride_physics::collision::{CollisionVolume, CollisionVolumeSet, CollisionWorld, ContentFlags, Pose, TraceShape};
use stride_physics::movement::{MoveFlags, MoveInput, MovementKernel, NoModifiers, StepEnv};
use stride_physics::{SweepConfig, SweepEngine};
use stride_protocol::{decode_replies, encode_batch};

use crate::config::{LinkConfig, SimConfig};

const ARENA_HALF: f32 = 30.0;
const PLAYER_ID: u64 = 1;

/// Collision volumes of the soak entity.
///
/// With async sweeping enabled the entity carries a pack behind the capsule
/// whose contacts may be answered by the worker pool.
pub fn soak_volumes(sweep: &SweepConfig) -> CollisionVolumeSet {
    let mut volumes = CollisionVolumeSet::single(TraceShape::HUMANOID);
    if sweep.async_workers > 0 {
        let pack = Pose::from_position(Vec3::new(0.0, 0.5, -0.45));
        volumes.add(CollisionVolume::new(1, TraceShape::Sphere { radius: 0.2 }, pack).with_async());
    }
    volumes
}

/// Flat arena with boundary walls, a few crates and a ramp.
pub fn build_arena() -> CollisionWorld {
    let mut world = CollisionWorld::new();
    world.add_box(
        Vec3::new(0.0, -0.5, 0.0),
        Vec3::new(ARENA_HALF, 0.5, ARENA_HALF),
        ContentFlags::SOLID,
    );

    let wall = 3.0;
    for (center, half) in [
        (Vec3::new(ARENA_HALF, wall, 0.0), Vec3::new(0.5, wall, ARENA_HALF)),
        (Vec3::new(-ARENA_HALF, wall, 0.0), Vec3::new(0.5, wall, ARENA_HALF)),
        (Vec3::new(0.0, wall, ARENA_HALF), Vec3::new(ARENA_HALF, wall, 0.5)),
        (Vec3::new(0.0, wall, -ARENA_HALF), Vec3::new(ARENA_HALF, wall, 0.5)),
    ] {
        world.add_box(center, half, ContentFlags::SOLID);
    }

    for center in [Vec3::new(8.0, 0.75, 5.0), Vec3::new(-6.0, 0.75, -9.0), Vec3::new(12.0, 0.75, -14.0)] {
        world.add_box(center, Vec3::splat(0.75), ContentFlags::SOLID);
    }
    // Knee-high ledge for stepping.
    world.add_box(Vec3::new(-12.0, 0.15, 10.0), Vec3::new(3.0, 0.15, 3.0), ContentFlags::SOLID);

    world.add_oriented_box(
        Pose::new(Vec3::new(18.0, 0.8, 18.0), Quat::from_rotation_z(0.3)),
        Vec3::new(4.0, 0.25, 3.0),
        ContentFlags::SOLID,
    );
    world
}

// ============================================================================
// Link
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub bytes: u64,
}

struct InFlight {
    deliver_at: u64,
    seq: u64,
    data: Vec<u8>,
}

/// One direction of an unreliable, delayed, reordering channel.
pub struct LossyLink {
    config: LinkConfig,
    in_flight: Vec<InFlight>,
    next_seq: u64,
    stats: LinkStats,
}

impl LossyLink {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            in_flight: Vec::new(),
            next_seq: 0,
            stats: LinkStats::default(),
        }
    }

    pub fn send(&mut self, now: u64, data: Vec<u8>, rng: &mut StdRng) {
        self.stats.sent += 1;
        self.stats.bytes += data.len() as u64;
        if rng.gen_bool(self.config.loss) {
            self.stats.dropped += 1;
            return;
        }

        let jitter = if self.config.jitter_ticks > 0 {
            rng.gen_range(0..=self.config.jitter_ticks)
        } else {
            0
        };
        self.in_flight.push(InFlight {
            deliver_at: now + (self.config.latency_ticks + jitter) as u64,
            seq: self.next_seq,
            data,
        });
        self.next_seq += 1;
    }

    /// Datagrams due by `now`, in arrival order.
    pub fn receive(&mut self, now: u64) -> Vec<Vec<u8>> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|packet| packet.deliver_at <= now);
        self.in_flight = pending;

        due.sort_by_key(|packet| (packet.deliver_at, packet.seq));
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|packet| packet.data).collect()
    }

    pub fn set_loss(&mut self, loss: f64) {
        self.config.loss = loss;
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

// ============================================================================
// Input Script
// ============================================================================

/// Wanders the arena: holds a heading for a while, then picks another.
struct InputScript {
    heading: f32,
    flags: MoveFlags,
    idle: bool,
    hold: u32,
}

impl InputScript {
    fn new() -> Self {
        Self {
            heading: 0.0,
            flags: MoveFlags::default(),
            idle: false,
            hold: 0,
        }
    }

    fn next(&mut self, position: Vec3, rng: &mut StdRng) -> MoveInput {
        if self.hold == 0 {
            self.hold = rng.gen_range(30..150);
            self.heading = rng.gen_range(0.0..std::f32::consts::TAU);
            self.idle = rng.gen_bool(0.1);

            self.flags = MoveFlags::default();
            if rng.gen_bool(0.3) {
                self.flags.press(MoveFlags::SPRINT);
            }
            if rng.gen_bool(0.1) {
                self.flags.press(MoveFlags::STOP);
            }
        }
        self.hold -= 1;

        let near_edge = position.x.abs() > ARENA_HALF - 5.0 || position.z.abs() > ARENA_HALF - 5.0;
        let direction = if near_edge {
            Vec3::new(-position.x, 0.0, -position.z).normalize_or_zero()
        } else if self.idle {
            Vec3::ZERO
        } else {
            Vec3::new(self.heading.cos(), 0.0, self.heading.sin())
        };

        let mut flags = self.flags;
        if rng.gen_bool(0.01) {
            flags.press(MoveFlags::JUMP);
        }
        MoveInput::new(direction, Quat::from_rotation_y(self.heading), flags)
    }
}

// ============================================================================
// Soak
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoakReport {
    pub ticks: u64,
    pub uplink: LinkStats,
    pub downlink: LinkStats,
    pub client: PredictionMetrics,
    pub server: ConnectionMetrics,
    pub time_discrepancy_detections: usize,
    pub client_tamper_reports: usize,
    pub correction_rate_reports: usize,
    pub sanction: Option<AntiCheatAction>,
    pub unacked_moves: usize,
    /// Client/server position difference once the link has drained.
    pub final_divergence: f32,
}

impl SoakReport {
    pub fn log(&self) {
        log::info!("soak finished after {} ticks", self.ticks);
        log::info!(
            "uplink: {} sent, {} dropped, {} delivered, {} bytes; downlink: {} sent, {} dropped, {} delivered, {} bytes",
            self.uplink.sent,
            self.uplink.dropped,
            self.uplink.delivered,
            self.uplink.bytes,
            self.downlink.sent,
            self.downlink.dropped,
            self.downlink.delivered,
            self.downlink.bytes
        );
        log::info!(
            "client: {} batches, {} combined, {} corrections applied ({} duplicate), {} moves replayed",
            self.client.batches_sent,
            self.client.moves_combined,
            self.client.corrections_applied,
            self.client.duplicate_corrections,
            self.client.moves_replayed
        );
        log::info!(
            "server: {} received, {} accepted, {} lenient, {} authority, {} corrections, {} duplicates, {} rejected",
            self.server.moves_received,
            self.server.moves_accepted,
            self.server.lenient_accepts,
            self.server.authority_grants + self.server.forced_grants,
            self.server.corrections_sent,
            self.server.duplicate_moves,
            self.server.moves_rejected
        );
        log::info!(
            "correction rate {:.2}%, final divergence {:.4} m, {} moves unacked",
            self.server.correction_rate() * 100.0,
            self.final_divergence,
            self.unacked_moves
        );
        if let Some(action) = self.sanction {
            log::warn!(
                "anti-cheat: {} time, {} tamper, {} correction-rate reports, sanction {:?}",
                self.time_discrepancy_detections,
                self.client_tamper_reports,
                self.correction_rate_reports,
                action
            );
        }
    }
}

pub struct Soak {
    config: SimConfig,
    client: ClientPredictor,
    arbiter: Arbiter<RecordingSink>,
    entity: ServerEntity,
    auth: AuthorityState,
    uplink: LossyLink,
    downlink: LossyLink,
    rng: StdRng,
    script: InputScript,
    tick: u64,
}

impl Soak {
    pub fn new(config: SimConfig) -> Self {
        let world = Arc::new(build_arena());
        let kernel = MovementKernel::new(config.movement.clone());
        let volumes = soak_volumes(&config.sweep);
        let spawn = Vec3::new(0.0, 1.0, 0.0);

        let arbiter = Arbiter::with_sink(config.arbiter.clone(), kernel.clone(), world.clone(), RecordingSink::default());
        let mut entity = arbiter.spawn_entity(PLAYER_ID, spawn, volumes.clone(), &NoModifiers);
        entity.sweeper = SweepEngine::for_world(config.sweep.clone(), &world);

        let mut sweeper = SweepEngine::for_world(config.sweep.clone(), &world);
        let state = {
            let env = StepEnv::new(&world, &volumes, &mut sweeper, &NoModifiers);
            kernel.spawn_at(spawn, &env)
        };
        let client =
            ClientPredictor::new(kernel, world, volumes, state, config.client.clone()).with_sweep_engine(sweeper);

        Self {
            uplink: LossyLink::new(config.link.clone()),
            downlink: LossyLink::new(config.link.clone()),
            rng: StdRng::seed_from_u64(config.link.seed),
            script: InputScript::new(),
            config,
            client,
            arbiter,
            entity,
            auth: AuthorityState::new(),
            tick: 0,
        }
    }

    /// Server time at the current tick.
    fn server_time(&self) -> f64 {
        self.tick as f64 * self.config.run.dt() as f64
    }

    /// Advance both ends by one tick.
    pub fn step(&mut self, input: &MoveInput) {
        self.tick += 1;
        let dt = self.config.run.dt();

        let client_dt = dt * self.config.run.client_clock_scale;
        if let Some(batch) = self.client.tick(input, client_dt, &NoModifiers) {
            match encode_batch(&batch) {
                Ok(data) => self.uplink.send(self.tick, data, &mut self.rng),
                Err(err) => log::warn!("failed to encode move batch: {}", err),
            }
        }

        let check = self.config.run.clock_check_ticks.max(1) as u64;
        if self.tick % check == 0 {
            self.client.observe_wall_clock(dt as f64 * check as f64);
        }

        let now = self.server_time();
        for data in self.uplink.receive(self.tick) {
            if let Some(reply) =
                self.arbiter
                    .handle_datagram(&mut self.entity, &mut self.auth, &data, now, &NoModifiers)
            {
                self.downlink.send(self.tick, reply, &mut self.rng);
            }
        }

        for data in self.downlink.receive(self.tick) {
            match decode_replies(&data) {
                Ok(packets) => {
                    for packet in &packets {
                        self.client.handle_packet(packet, &NoModifiers);
                    }
                }
                Err(err) => log::warn!("dropping malformed server packet: {}", err),
            }
        }
    }

    /// Run the scripted session, then drain the link without loss.
    pub fn run(mut self) -> SoakReport {
        let ticks = self.config.run.ticks;
        for i in 0..ticks {
            let input = self.script.next(self.client.state().position, &mut self.rng);
            self.step(&input);

            if (i + 1) % 600 == 0 {
                log::debug!(
                    "tick {}: {} corrections, {} unacked",
                    self.tick,
                    self.auth.metrics.corrections_sent,
                    self.client.buffer().len()
                );
            }
        }

        self.uplink.set_loss(0.0);
        self.downlink.set_loss(0.0);
        let settle = 2 * (self.config.link.latency_ticks + self.config.link.jitter_ticks) as u64 + 60;
        for _ in 0..settle {
            self.step(&MoveInput::default());
        }
        while !(self.uplink.is_idle() && self.downlink.is_idle()) {
            self.step(&MoveInput::default());
        }

        self.report()
    }

    pub fn report(&self) -> SoakReport {
        let events = &self.arbiter.sink().events;
        let count = |kind: fn(&Detection) -> bool| events.iter().filter(|e| kind(&e.detection)).count();

        SoakReport {
            ticks: self.tick,
            uplink: self.uplink.stats(),
            downlink: self.downlink.stats(),
            client: *self.client.metrics(),
            server: self.auth.metrics,
            time_discrepancy_detections: count(|d| matches!(d, Detection::TimeDiscrepancy { .. })),
            client_tamper_reports: count(|d| matches!(d, Detection::ClientTamper)),
            correction_rate_reports: count(|d| matches!(d, Detection::CorrectionRate { .. })),
            sanction: self.auth.sanction(),
            unacked_moves: self.client.buffer().len(),
            final_divergence: (self.client.state().position - self.entity.state.position).length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    fn config(ticks: u32, link: LinkConfig) -> SimConfig {
        SimConfig {
            run: RunConfig {
                ticks,
                ..Default::default()
            },
            link,
            ..Default::default()
        }
    }

    fn perfect_link() -> LinkConfig {
        LinkConfig {
            loss: 0.0,
            latency_ticks: 0,
            jitter_ticks: 0,
            seed: 3,
        }
    }

    #[test]
    fn test_link_delays_and_orders() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut link = LossyLink::new(LinkConfig {
            loss: 0.0,
            latency_ticks: 2,
            jitter_ticks: 0,
            seed: 1,
        });

        link.send(0, vec![1], &mut rng);
        link.send(1, vec![2], &mut rng);
        assert!(link.receive(1).is_empty());
        assert_eq!(link.receive(2), vec![vec![1]]);
        assert_eq!(link.receive(3), vec![vec![2]]);
        assert!(link.is_idle());
    }

    #[test]
    fn test_link_drops_roughly_the_configured_share() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut link = LossyLink::new(LinkConfig {
            loss: 0.25,
            ..perfect_link()
        });
        for tick in 0..4000 {
            link.send(tick, vec![0], &mut rng);
        }
        let share = link.stats().dropped as f64 / link.stats().sent as f64;
        assert!((0.2..0.3).contains(&share), "dropped share {}", share);
    }

    #[test]
    fn test_perfect_link_needs_no_corrections() {
        let report = Soak::new(config(900, perfect_link())).run();

        assert_eq!(report.server.corrections_sent, 0, "{:?}", report);
        assert!(report.final_divergence < 1e-3);
        assert!(report.unacked_moves <= 1, "only the unsent tail may remain");
        assert_eq!(report.sanction, None);
    }

    #[test]
    fn test_lossy_link_converges() {
        let link = LinkConfig {
            loss: 0.2,
            latency_ticks: 4,
            jitter_ticks: 2,
            seed: 11,
        };
        let report = Soak::new(config(1200, link)).run();

        assert!(report.uplink.dropped > 0);
        assert!(report.final_divergence < 0.05, "divergence {}", report.final_divergence);
        assert!(report.unacked_moves <= 1);
    }

    #[test]
    fn test_async_pack_volume_runs_on_workers() {
        let mut config = config(600, perfect_link());
        config.sweep.async_workers = 2;
        assert_eq!(soak_volumes(&config.sweep).len(), 2);

        let soak = Soak::new(config);
        assert!(soak.entity.sweeper.is_async(), "server sweeps the pack on workers");
        let report = soak.run();

        assert_eq!(report.ticks, 600);
        assert!(report.final_divergence < 0.05, "divergence {}", report.final_divergence);
        assert!(report.unacked_moves <= 1);
    }

    #[test]
    fn test_fast_client_clock_is_reported() {
        let mut config = config(600, perfect_link());
        config.run.client_clock_scale = 1.3;
        let report = Soak::new(config).run();

        assert!(report.time_discrepancy_detections > 0, "{:?}", report);
        assert!(report.client_tamper_reports > 0);
        assert_eq!(report.sanction, Some(AntiCheatAction::Log));
    }
}
