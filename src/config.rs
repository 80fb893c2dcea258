//! Soak run configuration.
//!
//! Every section is optional in the TOML file; missing values fall back to
//! the library defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stride_netcode::client::ClientConfig;
use stride_netcode::server::ArbiterConfig;
use stride_physics::{MovementConfig, SweepConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Simulated network between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Probability that a datagram is dropped, per direction.
    pub loss: f64,
    /// One-way delay in ticks.
    pub latency_ticks: u32,
    /// Extra random delay in ticks. Reorders packets when non-zero.
    pub jitter_ticks: u32,
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss: 0.05,
            latency_ticks: 3,
            jitter_ticks: 1,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub ticks: u32,
    pub tick_rate: f32,
    /// Scale applied to the client's simulated time. Above 1 models a sped-up client clock.
    pub client_clock_scale: f32,
    /// Ticks between wall clock checks on the client.
    pub clock_check_ticks: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ticks: 3600,
            tick_rate: 60.0,
            client_clock_scale: 1.0,
            clock_check_ticks: 30,
        }
    }
}

impl RunConfig {
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate
    }
}

/// Everything a soak run needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub run: RunConfig,
    pub link: LinkConfig,
    pub movement: MovementConfig,
    pub sweep: SweepConfig,
    pub client: ClientConfig,
    pub arbiter: ArbiterConfig,
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.run.tick_rate.is_finite() && self.run.tick_rate > 0.0) {
            return Err(ConfigError::Invalid(format!("tick_rate must be positive, got {}", self.run.tick_rate)));
        }
        if !(self.run.client_clock_scale.is_finite() && self.run.client_clock_scale > 0.0) {
            return Err(ConfigError::Invalid("client_clock_scale must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.link.loss) {
            return Err(ConfigError::Invalid(format!("link loss must be in [0, 1), got {}", self.link.loss)));
        }
        if self.client.buffer.capacity == 0 {
            return Err(ConfigError::Invalid("move buffer capacity must be non-zero".into()));
        }
        if self.run.dt() > self.arbiter.max_move_dt {
            return Err(ConfigError::Invalid(format!(
                "tick of {:.3}s exceeds the arbiter's max_move_dt {:.3}s",
                self.run.dt(),
                self.arbiter.max_move_dt
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = SimConfig::from_toml("").unwrap();
        assert_eq!(config, SimConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = SimConfig::from_toml(
            r#"
            [link]
            loss = 0.2

            [client]
            send_interval_ticks = 3

            [sweep]
            async_workers = 2

            [arbiter]
            accept_tolerance = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.link.loss, 0.2);
        assert_eq!(config.link.latency_ticks, LinkConfig::default().latency_ticks);
        assert_eq!(config.client.send_interval_ticks, 3);
        assert_eq!(config.client.buffer, ClientConfig::default().buffer);
        assert_eq!(config.arbiter.accept_tolerance, 0.05);
        assert_eq!(config.arbiter.budget_cap, ArbiterConfig::default().budget_cap);
        assert_eq!(config.sweep.async_workers, 2);
        assert_eq!(config.sweep.async_queue_depth, SweepConfig::default().async_queue_depth);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(SimConfig::from_toml("[link]\nloss = 1.5"), Err(ConfigError::Invalid(_))));
        assert!(matches!(SimConfig::from_toml("[run]\ntick_rate = 0.0"), Err(ConfigError::Invalid(_))));
        assert!(matches!(SimConfig::from_toml("[run]\ntick_rate = 2.0"), Err(ConfigError::Invalid(_))));
        assert!(matches!(SimConfig::from_toml("[link\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = SimConfig::load(Path::new("/nonexistent/stride.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/stride.toml"));
    }
}
