//! # Setpoint Smoothing
//!
//! Damps step changes on the physical actuator: every control cycle the written
//! setpoint moves only a fraction of the remaining distance toward the dispatch
//! point, a first-order exponential approach.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::power::Point;

/// Setpoint smoothing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Share of the remaining distance covered per cycle (0, 1]
    pub damping_factor: f64,

    /// Remaining distances at or below this snap to the target.
    /// 0 keeps the pure geometric approach.
    pub snap_threshold: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            damping_factor: 0.5,
            snap_threshold: 0.0,
        }
    }
}

impl SmoothingConfig {
    /// No smoothing, the dispatch point is written as is
    pub fn instant() -> Self {
        Self {
            damping_factor: 1.0,
            snap_threshold: 0.0,
        }
    }

    fn factor(&self) -> f64 {
        if self.damping_factor.is_finite() && self.damping_factor > 0.0 {
            self.damping_factor.min(1.0)
        } else {
            1.0
        }
    }
}

/// Tracks the last written point of one device
#[derive(Debug, Clone)]
pub struct SetpointSmoother {
    config: SmoothingConfig,
    current: Point,
}

impl SetpointSmoother {
    pub fn new(config: SmoothingConfig) -> Self {
        Self::with_initial(config, Point::ORIGIN)
    }

    pub fn with_initial(config: SmoothingConfig, initial: Point) -> Self {
        Self {
            config,
            current: initial,
        }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    pub fn current(&self) -> Point {
        self.current
    }

    /// Advances one cycle toward `target` and returns the point to write
    pub fn step(&mut self, target: Point) -> Point {
        let remaining = target - self.current;
        let distance = target.distance(self.current);
        self.current = if distance <= self.config.snap_threshold {
            target
        } else {
            self.current + remaining * self.config.factor()
        };
        self.current
    }

    /// Overrides the tracked point, e.g. after projecting it into a shrunken region
    pub fn force_to(&mut self, point: Point) {
        self.current = point;
    }

    pub fn reset(&mut self) {
        self.current = Point::ORIGIN;
    }
}

impl fmt::Display for SetpointSmoother {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SetpointSmoother(p={:.0}W, q={:.0}var, damping={})",
            self.current.p,
            self.current.q,
            self.config.factor()
        )
    }
}
