use anyhow::Result;
use ess_power_engine::{config, controller, telemetry};
use config::Config;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    if cfg.devices.is_empty() {
        warn!("no devices configured, the cluster will hold zero power");
    }

    let control = controller::ControlLoop::from_config(&cfg)?;
    info!(
        cluster = %cfg.cluster.id,
        devices = cfg.devices.len(),
        tick_seconds = cfg.controller.tick_seconds,
        "starting ESS power engine"
    );

    tokio::select! {
        result = control.run(cfg.controller.tick()) => result?,
        _ = telemetry::shutdown_signal() => {},
    }

    warn!("shutdown complete");
    Ok(())
}
