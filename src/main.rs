//! Stride - Loopback Soak Harness
//!
//! Runs a predicting client and a reconciling server in one process over a
//! lossy, latent link and reports how they agreed.

mod cli;
mod config;
mod loopback;

use anyhow::Context;
use clap::Parser;

use cli::Cli;
use config::SimConfig;
use loopback::Soak;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = &cli.log_level {
        logger.parse_filters(level);
    }
    logger.init();

    let mut config = match &cli.config {
        Some(path) => SimConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SimConfig::default(),
    };
    cli.apply(&mut config);
    config.validate().context("invalid command-line override")?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    log::info!(
        "stride soak: {} ticks at {} Hz, loss {:.0}%, latency {} ticks, seed {}",
        config.run.ticks,
        config.run.tick_rate,
        config.link.loss * 100.0,
        config.link.latency_ticks,
        config.link.seed
    );

    let report = Soak::new(config).run();
    report.log();

    Ok(())
}
