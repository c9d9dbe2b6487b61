pub mod cluster;
pub mod dispatcher;
pub mod smoothing;

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{EssDevice, Setpoint, SimulatedEss};
use crate::power::{Limitation, PowerError};

pub use cluster::{Allocation, ClusterAggregator, ClusterSummary, MemberAssignment};
pub use dispatcher::{DeviceDispatcher, LimitationId, SharedDevice};
pub use smoothing::{SetpointSmoother, SmoothingConfig};

/// A cluster member together with the channels of the physical device behind it
#[derive(Clone)]
pub struct ManagedEss {
    pub dispatcher: SharedDevice,
    pub device: Arc<dyn EssDevice>,
}

/// Outcome of one control cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub allocation: Allocation,
    pub rejected: Vec<(Limitation, PowerError)>,
    pub written: Vec<(String, Setpoint)>,
    pub write_failures: usize,
}

/// Drives one cluster: refresh, limit, allocate, dispatch, write
pub struct ControlLoop {
    cluster: Arc<ClusterAggregator>,
    members: Vec<ManagedEss>,
    standing: Mutex<Vec<Limitation>>,
    queued: Mutex<Vec<Limitation>>,
    render_regions: bool,
}

impl ControlLoop {
    pub fn new(cluster: Arc<ClusterAggregator>) -> Self {
        Self {
            cluster,
            members: Vec::new(),
            standing: Mutex::new(Vec::new()),
            queued: Mutex::new(Vec::new()),
            render_regions: false,
        }
    }

    /// Builds simulated devices and the cluster from configuration
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let cluster = Arc::new(ClusterAggregator::new(cfg.cluster.id.clone()));
        let mut control = ControlLoop::new(cluster.clone());
        control.render_regions = cfg.controller.render_regions;

        for device_cfg in &cfg.devices {
            let mut ess = SimulatedEss::new(
                device_cfg.rated_apparent_power,
                device_cfg.capacity_wh,
                device_cfg.initial_soc_percent,
                device_cfg.min_soc_percent,
            );
            ess.cycle_seconds = cfg.controller.tick().as_secs_f64();

            let mut dispatcher = DeviceDispatcher::new(
                device_cfg.id.clone(),
                device_cfg.rated_apparent_power,
                &cfg.engine,
            )?;
            for limitation in &device_cfg.static_limitations {
                dispatcher.add_static_limitation(limitation.clone());
            }
            control.add_member(dispatcher.into_shared(), Arc::new(ess));
        }

        for limitation in &cfg.cluster.static_limitations {
            cluster.add_static_limitation(limitation.clone());
        }

        let mut standing = Vec::new();
        if let Some(p) = cfg.cluster.active_power_target {
            standing.push(Limitation::active_power_equals("active power target", p));
        }
        if let Some(q) = cfg.cluster.reactive_power_target {
            standing.push(Limitation::reactive_power_equals("reactive power target", q));
        }
        control.set_standing_requests(standing);
        Ok(control)
    }

    pub fn cluster(&self) -> &Arc<ClusterAggregator> {
        &self.cluster
    }

    pub fn members(&self) -> &[ManagedEss] {
        &self.members
    }

    pub fn add_member(&mut self, dispatcher: SharedDevice, device: Arc<dyn EssDevice>) {
        self.cluster.add_member(dispatcher.clone());
        self.members.push(ManagedEss { dispatcher, device });
    }

    /// Requests applied to the cluster every cycle until replaced
    pub fn set_standing_requests(&self, requests: Vec<Limitation>) {
        *self.standing.lock() = requests;
    }

    /// Queues a request for the next cycle only
    pub fn request(&self, limitation: Limitation) {
        self.queued.lock().push(limitation);
    }

    pub async fn run(&self, tick: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_cycle().await {
                warn!(cluster = %self.cluster.id(), error = %e, "control cycle failed, previous setpoints stay in effect");
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        for member in &self.members {
            match member.device.read_measurements().await {
                Ok(measurements) => member.dispatcher.lock().update_measurements(measurements),
                Err(e) => {
                    let dispatcher = member.dispatcher.lock();
                    warn!(device = %dispatcher.id(), error = %e, "measurement refresh failed, keeping last values");
                }
            }
        }

        for member in &self.members {
            member.dispatcher.lock().begin_cycle();
        }
        self.cluster.begin_cycle();

        let mut requests = self.standing.lock().clone();
        requests.append(&mut self.queued.lock());
        let mut rejected = Vec::new();
        for limitation in requests {
            match self.cluster.apply_limitation(limitation.clone()) {
                Ok(applied) => debug!(cluster = %self.cluster.id(), limitation = %applied, "request applied"),
                Err(e) => {
                    warn!(cluster = %self.cluster.id(), limitation = %limitation, error = %e, "request rejected");
                    rejected.push((limitation, e));
                }
            }
        }

        let allocation = self.cluster.set_power();
        if self.render_regions {
            info!(cluster = %self.cluster.id(), region = %self.cluster.render().to_json(), "cluster region");
        }

        let mut written = Vec::new();
        let mut write_failures = 0;
        for member in &self.members {
            let Some((id, setpoint)) = next_setpoint(&mut member.dispatcher.lock(), &allocation) else {
                continue;
            };

            match member.device.write_setpoint(setpoint).await {
                Ok(()) => written.push((id, setpoint)),
                Err(e) => {
                    write_failures += 1;
                    warn!(device = %id, error = %e, "setpoint write failed");
                }
            }
        }

        let summary = self.cluster.summary();
        info!(
            cluster = %summary.cluster_id,
            soc = ?summary.soc,
            active_power = summary.active_power,
            reactive_power = summary.reactive_power,
            target_p = allocation.target.p,
            target_q = allocation.target.q,
            write_failures,
            "control cycle"
        );

        Ok(CycleReport {
            allocation,
            rejected,
            written,
            write_failures,
        })
    }
}

/// Dispatches a member unless it rejected its share, in which case whatever was written
/// last stays in effect
fn next_setpoint(dispatcher: &mut DeviceDispatcher, allocation: &Allocation) -> Option<(String, Setpoint)> {
    let id = dispatcher.id().to_string();
    if allocation.assignment(&id).is_some_and(|a| a.error.is_some()) {
        debug!(device = %id, "share rejected, keeping previous setpoint");
        return None;
    }
    let setpoint = dispatcher.dispatch();
    Some((id, setpoint))
}
