//! Compatibility shapes for older hub integrations.
//!
//! Each call is translated onto [`HardwareGateway::invoke`], so legacy callers
//! share the same per-device serialization as running jobs.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::hardware::adapter::Operation;
use crate::hardware::gateway::HardwareGateway;
use crate::hardware::DeviceError;

/// Device names the legacy surface addresses.
pub mod names {
    /// Illumination LED.
    pub const LED: &str = "led";
    /// Magnetic stirrer.
    pub const STIRRER: &str = "stirrer";
    /// Thermoelectric element.
    pub const PELTIER: &str = "peltier";
    /// RGB ring.
    pub const RING_LIGHT: &str = "ring_light";
    /// Pump bank.
    pub const PUMP: &str = "pump";
    /// Vial temperature probes.
    pub const TEMPERATURE: &str = "temperature";
    /// Photodiodes.
    pub const OPTICAL_DENSITY: &str = "optical_density";
    /// CO2 sensor.
    pub const CO2: &str = "co2";
}

/// Legacy request/response translation layer.
#[derive(Clone)]
pub struct LegacyHardwareApi {
    gateway: Arc<HardwareGateway>,
}

impl LegacyHardwareApi {
    /// Layer over `gateway`.
    pub const fn new(gateway: Arc<HardwareGateway>) -> Self {
        Self { gateway }
    }

    async fn control(&self, device: &str, args: Value) -> Result<Value, DeviceError> {
        self.gateway.invoke(device, Operation::Control, args).await
    }

    async fn read_field(&self, device: &str, field: &str) -> Result<Value, DeviceError> {
        let data = self.gateway.invoke(device, Operation::Read, Value::Null).await?;
        Ok(data.get(field).cloned().unwrap_or(Value::Null))
    }

    /// On/off LED: `true` is full power.
    pub async fn led(&self, state: bool) -> Result<Value, DeviceError> {
        let power = if state { 100.0 } else { 0.0 };
        self.control(names::LED, json!({ "power": power })).await
    }

    /// Peltier with integer power and a forward flag.
    pub async fn peltier(&self, power: u8, forward: bool) -> Result<Value, DeviceError> {
        let direction = if forward { "forward" } else { "reverse" };
        self.control(
            names::PELTIER,
            json!({ "duty_cycle": f64::from(power), "direction": direction }),
        )
        .await
    }

    /// Ring colour, whole ring or a single pixel.
    pub async fn ring_light(
        &self,
        red: u8,
        green: u8,
        blue: u8,
        pixel_index: Option<usize>,
    ) -> Result<Value, DeviceError> {
        self.control(
            names::RING_LIGHT,
            json!({ "red": red, "green": green, "blue": blue, "pixel_index": pixel_index }),
        )
        .await
    }

    /// One pump's velocity in mL/s.
    pub async fn pump(&self, name: &str, velocity: f64) -> Result<Value, DeviceError> {
        self.control(names::PUMP, json!({ "pump_name": name, "velocity": velocity }))
            .await
    }

    /// Stirrer duty cycle.
    pub async fn stirrer(&self, duty_cycle: f64) -> Result<Value, DeviceError> {
        self.control(names::STIRRER, json!({ "duty_cycle": duty_cycle }))
            .await
    }

    /// Every available sensor reading; missing sensors are omitted.
    pub async fn sensors_all(&self) -> Value {
        let mut out = Map::new();
        out.insert("status".into(), json!("success"));
        let sources = [
            (names::TEMPERATURE, "temperatures", "vial_temperatures"),
            (names::OPTICAL_DENSITY, "voltages", "photodiodes"),
            (names::CO2, "co2_ppm", "co2_ppm"),
        ];
        for (device, field, key) in sources {
            if let Ok(value) = self.read_field(device, field).await {
                out.insert(key.into(), value);
            }
        }
        Value::Object(out)
    }

    /// Vial temperatures.
    pub async fn temperature(&self) -> Result<Value, DeviceError> {
        let temperatures = self.read_field(names::TEMPERATURE, "temperatures").await?;
        Ok(json!({ "status": "success", "temperatures": temperatures }))
    }

    /// Photodiode voltages.
    pub async fn photodiodes(&self) -> Result<Value, DeviceError> {
        let readings = self.read_field(names::OPTICAL_DENSITY, "voltages").await?;
        Ok(json!({ "status": "success", "readings": readings }))
    }

    /// Node status with per-device initialization flags.
    #[must_use]
    pub fn status(&self) -> Value {
        let components: Map<String, Value> = self
            .gateway
            .registry()
            .status()
            .into_iter()
            .map(|(name, s)| (name, Value::Bool(s.initialized)))
            .collect();
        json!({
            "status": "operational",
            "hardware_available": components.values().any(|v| v == &Value::Bool(true)),
            "initialized_components": components,
        })
    }
}
