//! Feasible-power envelopes for energy storage systems and their clusters.
//!
//! [`power`] holds the P/Q geometry and limitations, [`controller`] the per-device
//! dispatchers, the cluster aggregator and the control loop driving them.

pub mod config;
pub mod controller;
pub mod domain;
pub mod power;
pub mod telemetry;
