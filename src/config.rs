use anyhow::{bail, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::controller::smoothing::SmoothingConfig;
use crate::power::Limitation;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub tick_seconds: u64,
    /// Log the cluster region as JSON every cycle
    #[serde(default)]
    pub render_regions: bool,
}

impl ControllerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

/// Settings shared by every device dispatcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub smoothing: SmoothingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    #[serde(default)]
    pub static_limitations: Vec<Limitation>,
    /// Standing active power request applied every cycle (W, positive discharges)
    pub active_power_target: Option<f64>,
    /// Standing reactive power request applied every cycle (var)
    pub reactive_power_target: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub rated_apparent_power: f64,
    pub capacity_wh: f64,
    pub initial_soc_percent: f64,
    pub min_soc_percent: f64,
    #[serde(default)]
    pub static_limitations: Vec<Limitation>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ESS__").split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.id.trim().is_empty() {
            bail!("cluster id must not be empty");
        }
        for (i, device) in self.devices.iter().enumerate() {
            if device.id.trim().is_empty() {
                bail!("device #{i} has an empty id");
            }
            if self.devices[..i].iter().any(|other| other.id == device.id) {
                bail!("duplicate device id {}", device.id);
            }
            if !device.rated_apparent_power.is_finite() || device.rated_apparent_power <= 0.0 {
                bail!(
                    "device {}: rated apparent power must be positive, got {}",
                    device.id,
                    device.rated_apparent_power
                );
            }
            if device.capacity_wh <= 0.0 {
                bail!("device {}: capacity must be positive", device.id);
            }
            if !(0.0..=100.0).contains(&device.initial_soc_percent)
                || !(0.0..=100.0).contains(&device.min_soc_percent)
            {
                bail!("device {}: state of charge values must be within 0..=100 %", device.id);
            }
        }
        Ok(())
    }
}
