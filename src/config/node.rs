//! Execution node configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{env_value, invalid, process_env, ConfigError};
use crate::core::SandboxLimits;
use crate::sandbox::SandboxSettings;

/// Smallest accepted memory ceiling.
pub const MIN_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

const fn default_true() -> bool {
    true
}

const fn default_pixel_count() -> usize {
    16
}

const fn default_channels() -> usize {
    4
}

const fn default_max_velocity() -> f64 {
    10.0
}

fn default_pumps() -> Vec<String> {
    (1..=4).map(|i| format!("pump{i}")).collect()
}

/// Device family and its family-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    /// PWM LED.
    Led,
    /// PWM stirrer.
    Stirrer,
    /// Directional thermoelectric element.
    Peltier,
    /// Addressable RGB ring.
    RingLight {
        /// Number of pixels.
        #[serde(default = "default_pixel_count")]
        pixel_count: usize,
    },
    /// Named stepper pumps.
    Pump {
        /// Pump names.
        #[serde(default = "default_pumps")]
        pumps: Vec<String>,
        /// Maximum absolute velocity in mL/s.
        #[serde(default = "default_max_velocity")]
        max_velocity: f64,
    },
    /// Temperature probes.
    Temperature {
        /// Probe count.
        #[serde(default = "default_channels")]
        channels: usize,
    },
    /// Photodiodes.
    OpticalDensity {
        /// Photodiode count.
        #[serde(default = "default_channels")]
        channels: usize,
    },
    /// CO2 sensor.
    Co2,
}

/// One configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name used by jobs.
    pub name: String,
    /// Disabled devices are listed but never initialized.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Device node that must exist for initialization to succeed.
    #[serde(default)]
    pub probe_path: Option<PathBuf>,
    /// Family-specific settings.
    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl DeviceConfig {
    /// Enabled device without a probe path.
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            probe_path: None,
            kind,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid("device name must not be empty"));
        }
        match &self.kind {
            DeviceKind::RingLight { pixel_count: 0 } => Err(invalid(format!(
                "device `{}`: pixel_count must be greater than 0",
                self.name
            ))),
            DeviceKind::Pump { pumps, max_velocity } => {
                if pumps.is_empty() {
                    return Err(invalid(format!("device `{}`: no pumps listed", self.name)));
                }
                if !(max_velocity.is_finite() && *max_velocity > 0.0) {
                    return Err(invalid(format!(
                        "device `{}`: max_velocity must be positive",
                        self.name
                    )));
                }
                Ok(())
            }
            DeviceKind::Temperature { channels: 0 } | DeviceKind::OpticalDensity { channels: 0 } => {
                Err(invalid(format!(
                    "device `{}`: channels must be greater than 0",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// The standard device set of a bioreactor node.
#[must_use]
pub fn default_devices() -> Vec<DeviceConfig> {
    vec![
        DeviceConfig::new("led", DeviceKind::Led),
        DeviceConfig::new("stirrer", DeviceKind::Stirrer),
        DeviceConfig::new("peltier", DeviceKind::Peltier),
        DeviceConfig::new(
            "ring_light",
            DeviceKind::RingLight {
                pixel_count: default_pixel_count(),
            },
        ),
        DeviceConfig::new(
            "pump",
            DeviceKind::Pump {
                pumps: default_pumps(),
                max_velocity: default_max_velocity(),
            },
        ),
        DeviceConfig::new(
            "temperature",
            DeviceKind::Temperature {
                channels: default_channels(),
            },
        ),
        DeviceConfig::new(
            "optical_density",
            DeviceKind::OpticalDensity {
                channels: default_channels(),
            },
        ),
        DeviceConfig::new("co2", DeviceKind::Co2),
    ]
}

/// Sandbox, gateway and device settings of an execution node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Parent of all run directories.
    pub work_root: PathBuf,
    /// Interpreter program and leading arguments.
    pub interpreter: Vec<String>,
    /// Wait between graceful and forced termination, in seconds.
    pub grace_period_secs: u64,
    /// Gateway endpoint exported to jobs.
    pub gateway_url: String,
    /// Bound on each device call, in milliseconds.
    pub device_op_timeout_ms: u64,
    /// Bound on each device initialization, in milliseconds.
    pub device_init_timeout_ms: u64,
    /// cgroup v2 parent directory; absent means no memory or cpu enforcement.
    pub cgroup_root: Option<PathBuf>,
    /// Finished runs remembered for late polls.
    pub run_history: usize,
    /// Configured devices.
    pub devices: Vec<DeviceConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let sandbox = SandboxSettings::default();
        Self {
            work_root: sandbox.work_root,
            interpreter: sandbox.interpreter,
            grace_period_secs: sandbox.grace_period.as_secs(),
            gateway_url: sandbox.gateway_url,
            device_op_timeout_ms: 5_000,
            device_init_timeout_ms: 5_000,
            cgroup_root: None,
            run_history: crate::runtime::host::DEFAULT_HISTORY,
            devices: default_devices(),
        }
    }
}

/// Range checks shared by hub and node limits.
pub(crate) fn validate_limits(limits: &SandboxLimits) -> Result<(), ConfigError> {
    if limits.memory_bytes < MIN_MEMORY_BYTES {
        return Err(invalid(format!(
            "memory_bytes must be at least {MIN_MEMORY_BYTES}"
        )));
    }
    #[allow(clippy::cast_precision_loss)]
    let cores = num_cpus::get() as f64;
    if !(limits.cpu_share.is_finite() && limits.cpu_share > 0.0 && limits.cpu_share <= cores) {
        return Err(invalid(format!(
            "cpu_share must be within (0, {cores}], got {}",
            limits.cpu_share
        )));
    }
    if limits.deadline_secs == 0 {
        return Err(invalid("deadline_secs must be greater than 0"));
    }
    Ok(())
}

impl NodeConfig {
    /// Validate value ranges and device names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.is_empty() || self.interpreter[0].trim().is_empty() {
            return Err(invalid("interpreter must name a program"));
        }
        if self.device_op_timeout_ms == 0 || self.device_init_timeout_ms == 0 {
            return Err(invalid("device timeouts must be greater than 0"));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.name.as_str()) {
                return Err(invalid(format!("duplicate device name `{}`", device.name)));
            }
        }
        Ok(())
    }

    /// Parse node configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `REACTORLAB_*` variables (after loading `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env())
    }

    /// Defaults overridden by variables resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = env_value::<PathBuf>(&lookup, "WORK_ROOT")? {
            cfg.work_root = v;
        }
        if let Some(v) = env_value::<String>(&lookup, "INTERPRETER")? {
            cfg.interpreter = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = env_value(&lookup, "GATEWAY_URL")? {
            cfg.gateway_url = v;
        }
        if let Some(v) = env_value::<PathBuf>(&lookup, "CGROUP_ROOT")? {
            cfg.cgroup_root = Some(v);
        }
        if let Some(v) = env_value(&lookup, "GRACE_PERIOD_SECS")? {
            cfg.grace_period_secs = v;
        }
        if let Some(v) = env_value(&lookup, "DEVICE_OP_TIMEOUT_MS")? {
            cfg.device_op_timeout_ms = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Runner settings derived from this configuration.
    #[must_use]
    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            work_root: self.work_root.clone(),
            interpreter: self.interpreter.clone(),
            gateway_url: self.gateway_url.clone(),
            grace_period: Duration::from_secs(self.grace_period_secs),
            cgroup_root: self.cgroup_root.clone(),
            ..SandboxSettings::default()
        }
    }

    /// Bound on each device call.
    #[must_use]
    pub const fn device_op_timeout(&self) -> Duration {
        Duration::from_millis(self.device_op_timeout_ms)
    }

    /// Bound on each device initialization.
    #[must_use]
    pub const fn device_init_timeout(&self) -> Duration {
        Duration::from_millis(self.device_init_timeout_ms)
    }
}
