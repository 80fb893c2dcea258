//! Command-line arguments for the soak harness.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use stride_physics::MovementConfig;

use crate::config::SimConfig;

/// Movement tuning presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    Humanoid,
    Quadruped,
    Flyer,
}

impl Preset {
    pub fn movement(self) -> MovementConfig {
        match self {
            Preset::Humanoid => MovementConfig::humanoid(),
            Preset::Quadruped => MovementConfig::quadruped(),
            Preset::Flyer => MovementConfig::flyer(),
        }
    }
}

/// Run a predicting client against a reconciling server over a simulated
/// lossy link and report how often they disagreed.
#[derive(Debug, Parser)]
#[command(name = "stride", version, about)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Number of ticks to simulate
    #[arg(short, long)]
    pub ticks: Option<u32>,

    /// Packet loss probability per direction
    #[arg(long)]
    pub loss: Option<f64>,

    /// One-way latency in ticks
    #[arg(long)]
    pub latency: Option<u32>,

    /// Seed for loss, jitter and the input script
    #[arg(long)]
    pub seed: Option<u64>,

    /// Movement preset, replacing the configured movement section
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,

    /// Worker threads for async volume sweeps (0 keeps sweeps synchronous)
    #[arg(long, value_name = "N")]
    pub async_workers: Option<usize>,

    /// Speed up the client's clock by this factor
    #[arg(long, value_name = "SCALE")]
    pub clock_scale: Option<f32>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Overlay command-line values on a loaded configuration.
    pub fn apply(&self, config: &mut SimConfig) {
        if let Some(ticks) = self.ticks {
            config.run.ticks = ticks;
        }
        if let Some(loss) = self.loss {
            config.link.loss = loss;
        }
        if let Some(latency) = self.latency {
            config.link.latency_ticks = latency;
        }
        if let Some(seed) = self.seed {
            config.link.seed = seed;
        }
        if let Some(preset) = self.preset {
            config.movement = preset.movement();
        }
        if let Some(workers) = self.async_workers {
            config.sweep.async_workers = workers;
        }
        if let Some(scale) = self.clock_scale {
            config.run.client_clock_scale = scale;
        }
    }
}
