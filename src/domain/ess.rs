use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::power::Point;

/// ESS-specific errors
#[derive(Debug, Error)]
pub enum EssError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Invalid setpoint: P={0}W Q={1}var (exceeds rated apparent power)")]
    InvalidSetpoint(f64, f64),
    #[error("ESS offline or unavailable")]
    Offline,
}

/// Measured inputs used as allocation weights. Every value may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EssMeasurements {
    /// State of charge (%)
    pub soc: Option<f64>,
    /// Configured minimum state of charge (%)
    pub min_soc: Option<f64>,
    /// Nominal power (VA)
    pub nominal_power: Option<f64>,
    /// Usable capacity (Wh)
    pub capacity_wh: Option<f64>,
}

impl EssMeasurements {
    /// `soc - min_soc`; negative when the device needs charging. Missing values count as 0.
    pub fn usable_headroom(&self) -> f64 {
        self.soc.unwrap_or(0.0) - self.min_soc.unwrap_or(0.0)
    }
}

/// Active/reactive power command. Positive active power discharges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    pub active_power: f64,
    pub reactive_power: f64,
}

impl Setpoint {
    pub fn new(active_power: f64, reactive_power: f64) -> Self {
        Self {
            active_power,
            reactive_power,
        }
    }

    pub fn as_point(&self) -> Point {
        Point::new(self.active_power, self.reactive_power)
    }

    pub fn apparent_power(&self) -> f64 {
        self.active_power.hypot(self.reactive_power)
    }
}

impl From<Point> for Setpoint {
    fn from(point: Point) -> Self {
        Self::new(point.p, point.q)
    }
}

/// Read and write channels of one storage system
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EssDevice: Send + Sync {
    fn rated_apparent_power(&self) -> f64;
    async fn read_measurements(&self) -> Result<EssMeasurements>;
    async fn write_setpoint(&self, setpoint: Setpoint) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedEssState {
    pub soc_percent: f64,
    pub setpoint: Setpoint,
    pub writes: u64,
}

/// Simulated storage system integrating its state of charge from written active power
#[derive(Debug)]
pub struct SimulatedEss {
    state: Arc<RwLock<SimulatedEssState>>,
    rated_apparent_power: f64,
    capacity_wh: f64,
    min_soc_percent: f64,
    /// Length of one control cycle (s)
    pub cycle_seconds: f64,
    offline: Arc<AtomicBool>,
}

impl SimulatedEss {
    pub fn new(rated_apparent_power: f64, capacity_wh: f64, soc_percent: f64, min_soc_percent: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(SimulatedEssState {
                soc_percent: soc_percent.clamp(0.0, 100.0),
                setpoint: Setpoint::default(),
                writes: 0,
            })),
            rated_apparent_power,
            capacity_wh,
            min_soc_percent,
            cycle_seconds: 1.0,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every read and write fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn state(&self) -> SimulatedEssState {
        self.state.read().await.clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EssError::Offline.into());
        }
        Ok(())
    }
}

#[async_trait]
impl EssDevice for SimulatedEss {
    fn rated_apparent_power(&self) -> f64 {
        self.rated_apparent_power
    }

    async fn read_measurements(&self) -> Result<EssMeasurements> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(EssMeasurements {
            soc: Some(state.soc_percent),
            min_soc: Some(self.min_soc_percent),
            nominal_power: Some(self.rated_apparent_power),
            capacity_wh: Some(self.capacity_wh),
        })
    }

    async fn write_setpoint(&self, setpoint: Setpoint) -> Result<()> {
        self.check_online()?;
        // 1 VA of slack for rounded setpoints
        if setpoint.apparent_power() > self.rated_apparent_power + 1.0 {
            return Err(EssError::InvalidSetpoint(setpoint.active_power, setpoint.reactive_power).into());
        }

        let mut st = self.state.write().await;
        let energy_wh = setpoint.active_power * self.cycle_seconds / 3600.0;
        let delta_pct = energy_wh / self.capacity_wh.max(1.0) * 100.0;
        st.soc_percent = (st.soc_percent - delta_pct).clamp(0.0, 100.0);
        st.setpoint = setpoint;
        st.writes += 1;
        Ok(())
    }
}
