//! Simulated adapters for the device families of a bioreactor node.
//!
//! The register-level drivers live outside this crate; these adapters keep
//! the last commanded state in memory and validate arguments exactly as a
//! real driver front-end would. A `probe_path` (for example an I2C bus node)
//! makes initialization fail when the device file is absent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::hardware::adapter::{
    parse_args, CapabilityDescriptor, DeviceAdapter, DeviceType, Operation,
};
use crate::hardware::DeviceError;

fn probe(name: &str, probe_path: Option<&Path>) -> Result<(), DeviceError> {
    match probe_path {
        Some(path) if !path.exists() => Err(DeviceError::Driver(format!(
            "{name}: device node {} not found",
            path.display()
        ))),
        _ => Ok(()),
    }
}

fn percent(value: f64, field: &str) -> Result<f64, DeviceError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(DeviceError::InvalidArguments(format!(
            "{field} must be within 0..=100, got {value}"
        )))
    }
}

fn actuator(name: &str, descriptor: Value) -> CapabilityDescriptor {
    CapabilityDescriptor {
        name: name.to_string(),
        device_type: DeviceType::Actuator,
        operations: vec![Operation::Control, Operation::Read],
        descriptor,
    }
}

/// Which PWM device this is; decides the argument name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmKind {
    /// Illumination LED, commanded with `power`.
    Led,
    /// Magnetic stirrer, commanded with `duty_cycle`.
    Stirrer,
}

impl PwmKind {
    const fn field(self) -> &'static str {
        match self {
            Self::Led => "power",
            Self::Stirrer => "duty_cycle",
        }
    }
}

#[derive(Deserialize)]
struct PwmRequest {
    #[serde(alias = "power", alias = "duty")]
    duty_cycle: f64,
}

/// Single-channel PWM actuator (LED or stirrer), 0–100 %.
pub struct PwmAdapter {
    name: String,
    kind: PwmKind,
    probe_path: Option<PathBuf>,
    duty: Mutex<f64>,
}

impl PwmAdapter {
    /// New adapter, initially off.
    pub fn new(name: impl Into<String>, kind: PwmKind, probe_path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            probe_path,
            duty: Mutex::new(0.0),
        }
    }

    fn state(&self, duty: f64) -> Value {
        json!({ self.kind.field(): duty, "active": duty > 0.0 })
    }
}

#[async_trait]
impl DeviceAdapter for PwmAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> CapabilityDescriptor {
        actuator(
            &self.name,
            json!({
                "control_type": "pwm",
                "parameters": [self.kind.field()],
                "range": [0, 100],
                "unit": "percent",
            }),
        )
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        probe(&self.name, self.probe_path.as_deref())?;
        *self.duty.lock() = 0.0;
        Ok(())
    }

    async fn control(&self, args: Value) -> Result<Value, DeviceError> {
        let request: PwmRequest = parse_args(args)?;
        let duty = percent(request.duty_cycle, self.kind.field())?;
        *self.duty.lock() = duty;
        debug!(device = %self.name, duty, "pwm set");
        Ok(self.state(duty))
    }

    async fn read(&self, _args: Value) -> Result<Value, DeviceError> {
        Ok(self.state(*self.duty.lock()))
    }
}

#[derive(Deserialize)]
struct PeltierRequest {
    #[serde(alias = "duty", alias = "power")]
    duty_cycle: f64,
    direction: String,
}

/// Thermoelectric element: duty cycle plus heating direction.
pub struct PeltierAdapter {
    name: String,
    probe_path: Option<PathBuf>,
    state: Mutex<(f64, String)>,
}

impl PeltierAdapter {
    /// New adapter, initially off.
    pub fn new(name: impl Into<String>, probe_path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            probe_path,
            state: Mutex::new((0.0, "forward".into())),
        }
    }
}

#[async_trait]
impl DeviceAdapter for PeltierAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> CapabilityDescriptor {
        actuator(
            &self.name,
            json!({
                "control_type": "pwm_directional",
                "parameters": ["duty_cycle", "direction"],
                "range": [0, 100],
                "directions": ["heat", "cool", "forward", "reverse"],
            }),
        )
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        probe(&self.name, self.probe_path.as_deref())
    }

    async fn control(&self, args: Value) -> Result<Value, DeviceError> {
        let request: PeltierRequest = parse_args(args)?;
        let duty = percent(request.duty_cycle, "duty_cycle")?;
        if !matches!(request.direction.as_str(), "heat" | "cool" | "forward" | "reverse") {
            return Err(DeviceError::InvalidArguments(format!(
                "direction must be heat, cool, forward or reverse, got `{}`",
                request.direction
            )));
        }
        *self.state.lock() = (duty, request.direction.clone());
        Ok(json!({ "duty_cycle": duty, "direction": request.direction, "active": duty > 0.0 }))
    }

    async fn read(&self, _args: Value) -> Result<Value, DeviceError> {
        let (duty, direction) = self.state.lock().clone();
        Ok(json!({ "duty_cycle": duty, "direction": direction, "active": duty > 0.0 }))
    }
}

#[derive(Deserialize)]
struct RingLightRequest {
    red: u8,
    green: u8,
    blue: u8,
    #[serde(default)]
    pixel_index: Option<usize>,
}

/// Addressable RGB ring.
pub struct RingLightAdapter {
    name: String,
    probe_path: Option<PathBuf>,
    pixels: Mutex<Vec<[u8; 3]>>,
}

impl RingLightAdapter {
    /// New ring with `pixel_count` dark pixels.
    pub fn new(name: impl Into<String>, pixel_count: usize, probe_path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            probe_path,
            pixels: Mutex::new(vec![[0; 3]; pixel_count]),
        }
    }
}

#[async_trait]
impl DeviceAdapter for RingLightAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> CapabilityDescriptor {
        actuator(
            &self.name,
            json!({
                "control_type": "rgb",
                "parameters": ["red", "green", "blue", "pixel_index"],
                "color_range": [0, 255],
                "pixel_count": self.pixels.lock().len(),
            }),
        )
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        probe(&self.name, self.probe_path.as_deref())
    }

    async fn control(&self, args: Value) -> Result<Value, DeviceError> {
        let request: RingLightRequest = parse_args(args)?;
        let color = [request.red, request.green, request.blue];
        let mut pixels = self.pixels.lock();
        match request.pixel_index {
            Some(index) if index >= pixels.len() => {
                return Err(DeviceError::InvalidArguments(format!(
                    "pixel_index {index} out of range 0..{}",
                    pixels.len()
                )));
            }
            Some(index) => pixels[index] = color,
            None => pixels.iter_mut().for_each(|p| *p = color),
        }
        Ok(json!({ "color": color, "pixel_index": request.pixel_index }))
    }

    async fn read(&self, _args: Value) -> Result<Value, DeviceError> {
        Ok(json!({ "pixels": *self.pixels.lock() }))
    }
}

#[derive(Deserialize)]
struct PumpRequest {
    #[serde(alias = "name", alias = "pump")]
    pump_name: String,
    velocity: f64,
}

/// Bank of named stepper pumps, velocity in mL/s (negative reverses).
pub struct PumpAdapter {
    name: String,
    probe_path: Option<PathBuf>,
    max_velocity: f64,
    velocities: Mutex<BTreeMap<String, f64>>,
}

impl PumpAdapter {
    /// New bank with every pump stopped.
    pub fn new(
        name: impl Into<String>,
        pumps: &[String],
        max_velocity: f64,
        probe_path: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            probe_path,
            max_velocity,
            velocities: Mutex::new(pumps.iter().map(|p| (p.clone(), 0.0)).collect()),
        }
    }
}

#[async_trait]
impl DeviceAdapter for PumpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> CapabilityDescriptor {
        let pumps: Vec<String> = self.velocities.lock().keys().cloned().collect();
        actuator(
            &self.name,
            json!({
                "control_type": "stepper",
                "parameters": ["pump_name", "velocity"],
                "available_pumps": pumps,
                "velocity_range": [-self.max_velocity, self.max_velocity],
                "unit": "mL/s",
            }),
        )
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        probe(&self.name, self.probe_path.as_deref())
    }

    async fn control(&self, args: Value) -> Result<Value, DeviceError> {
        let request: PumpRequest = parse_args(args)?;
        if !request.velocity.is_finite() || request.velocity.abs() > self.max_velocity {
            return Err(DeviceError::InvalidArguments(format!(
                "velocity must be within ±{} mL/s, got {}",
                self.max_velocity, request.velocity
            )));
        }
        let mut velocities = self.velocities.lock();
        let slot = velocities.get_mut(&request.pump_name).ok_or_else(|| {
            DeviceError::InvalidArguments(format!("unknown pump `{}`", request.pump_name))
        })?;
        *slot = request.velocity;
        Ok(json!({
            "pump_name": request.pump_name,
            "velocity": request.velocity,
            "active": request.velocity != 0.0,
        }))
    }

    async fn read(&self, _args: Value) -> Result<Value, DeviceError> {
        Ok(json!({ "velocities": *self.velocities.lock() }))
    }
}

/// Which quantity a sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Vial temperatures in °C, one per channel.
    Temperature,
    /// Photodiode voltages, one per channel.
    OpticalDensity,
    /// Single CO2 concentration in ppm.
    Co2,
}

impl SensorKind {
    const fn field(self) -> &'static str {
        match self {
            Self::Temperature => "temperatures",
            Self::OpticalDensity => "voltages",
            Self::Co2 => "co2_ppm",
        }
    }

    const fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "celsius",
            Self::OpticalDensity => "volts",
            Self::Co2 => "ppm",
        }
    }

    const fn baseline(self) -> f64 {
        match self {
            Self::Temperature => 37.0,
            Self::OpticalDensity => 0.5,
            Self::Co2 => 415.0,
        }
    }
}

/// Read-only sensor. Control calls are rejected.
pub struct SensorAdapter {
    name: String,
    kind: SensorKind,
    probe_path: Option<PathBuf>,
    values: Mutex<Vec<f64>>,
}

impl SensorAdapter {
    /// New sensor reporting a plausible baseline on every channel.
    pub fn new(
        name: impl Into<String>,
        kind: SensorKind,
        channels: usize,
        probe_path: Option<PathBuf>,
    ) -> Self {
        let channels = if kind == SensorKind::Co2 { 1 } else { channels.max(1) };
        Self {
            name: name.into(),
            kind,
            probe_path,
            values: Mutex::new(vec![kind.baseline(); channels]),
        }
    }

    /// Override the simulated readings.
    pub fn set_values(&self, values: Vec<f64>) {
        *self.values.lock() = values;
    }
}

#[async_trait]
impl DeviceAdapter for SensorAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: self.name.clone(),
            device_type: DeviceType::Sensor,
            operations: vec![Operation::Read],
            descriptor: json!({
                "measurement": self.kind.field(),
                "unit": self.kind.unit(),
                "channels": self.values.lock().len(),
            }),
        }
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        probe(&self.name, self.probe_path.as_deref())
    }

    async fn read(&self, _args: Value) -> Result<Value, DeviceError> {
        let values = self.values.lock().clone();
        let reading = match self.kind {
            SensorKind::Co2 => json!(values.first().copied().unwrap_or_default()),
            _ => json!(values),
        };
        Ok(json!({ self.kind.field(): reading, "unit": self.kind.unit() }))
    }
}
