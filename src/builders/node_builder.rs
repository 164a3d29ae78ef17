//! Assemble an execution node: devices, registry, gateway, sandbox host.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::{DeviceConfig, DeviceKind, NodeConfig};
use crate::core::{AppResult, Spawn};
use crate::hardware::devices::{
    PeltierAdapter, PumpAdapter, PwmAdapter, PwmKind, RingLightAdapter, SensorAdapter, SensorKind,
};
use crate::hardware::{
    CapabilityRegistry, DeviceAdapter, DeviceSlot, HardwareGateway, LegacyHardwareApi,
};
use crate::runtime::host::ExecutionHost;
use crate::sandbox::SandboxRunner;

/// A running execution node.
pub struct Node<S> {
    /// Devices that initialized.
    pub registry: Arc<CapabilityRegistry>,
    /// Serialized device access for jobs.
    pub gateway: Arc<HardwareGateway>,
    /// Sandbox host answering start/poll/stop.
    pub host: Arc<ExecutionHost<S>>,
    /// Compatibility surface over the gateway.
    pub legacy: LegacyHardwareApi,
}

/// Adapter for one configured device.
#[must_use]
pub fn build_adapter(device: &DeviceConfig) -> Arc<dyn DeviceAdapter> {
    let name = device.name.clone();
    let probe = device.probe_path.clone();
    match &device.kind {
        DeviceKind::Led => Arc::new(PwmAdapter::new(name, PwmKind::Led, probe)),
        DeviceKind::Stirrer => Arc::new(PwmAdapter::new(name, PwmKind::Stirrer, probe)),
        DeviceKind::Peltier => Arc::new(PeltierAdapter::new(name, probe)),
        DeviceKind::RingLight { pixel_count } => {
            Arc::new(RingLightAdapter::new(name, *pixel_count, probe))
        }
        DeviceKind::Pump {
            pumps,
            max_velocity,
        } => Arc::new(PumpAdapter::new(name, pumps, *max_velocity, probe)),
        DeviceKind::Temperature { channels } => Arc::new(SensorAdapter::new(
            name,
            SensorKind::Temperature,
            *channels,
            probe,
        )),
        DeviceKind::OpticalDensity { channels } => Arc::new(SensorAdapter::new(
            name,
            SensorKind::OpticalDensity,
            *channels,
            probe,
        )),
        DeviceKind::Co2 => Arc::new(SensorAdapter::new(name, SensorKind::Co2, 1, probe)),
    }
}

/// Validate `cfg`, initialize every enabled device and wire the sandbox host.
///
/// Device failures do not abort the build; they surface through
/// [`CapabilityRegistry::status`].
pub async fn build_node<S: Spawn>(cfg: &NodeConfig, spawner: S) -> AppResult<Node<S>> {
    cfg.validate().context("node configuration invalid")?;
    std::fs::create_dir_all(&cfg.work_root)
        .with_context(|| format!("creating work root {}", cfg.work_root.display()))?;

    let slots = cfg
        .devices
        .iter()
        .map(|device| {
            let adapter = build_adapter(device);
            if device.enabled {
                DeviceSlot::enabled(adapter)
            } else {
                DeviceSlot::disabled(adapter)
            }
        })
        .collect();
    let registry = Arc::new(CapabilityRegistry::initialize(slots, cfg.device_init_timeout()).await);
    let gateway = Arc::new(HardwareGateway::new(
        Arc::clone(&registry),
        cfg.device_op_timeout(),
    ));
    let runner = SandboxRunner::new(cfg.sandbox_settings(), spawner);
    let host = Arc::new(
        ExecutionHost::new(runner, Arc::clone(&gateway)).with_history(cfg.run_history),
    );
    info!(
        devices = registry.describe().len(),
        configured = cfg.devices.len(),
        work_root = %cfg.work_root.display(),
        "execution node ready"
    );
    Ok(Node {
        legacy: LegacyHardwareApi::new(Arc::clone(&gateway)),
        registry,
        gateway,
        host,
    })
}
