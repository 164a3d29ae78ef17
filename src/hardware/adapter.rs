//! The adapter contract every device implements.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hardware::DeviceError;

/// Capability a caller can invoke on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Drive an actuator.
    Control,
    /// Read a sensor or an actuator's current state.
    Read,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Control => "control",
            Self::Read => "read",
        })
    }
}

/// Broad device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Writes to the physical world.
    Actuator,
    /// Only observes.
    Sensor,
}

/// Static description of a device, as returned by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique device name.
    pub name: String,
    /// Device family.
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Supported operations.
    pub operations: Vec<Operation>,
    /// Type-specific metadata such as value ranges and units.
    pub descriptor: Value,
}

impl CapabilityDescriptor {
    /// Whether `op` is listed.
    #[must_use]
    pub fn supports(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }
}

/// Uniform wrapper around one physical device.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Unique name under which the device is registered.
    fn name(&self) -> &str;

    /// Static capability descriptor.
    fn describe(&self) -> CapabilityDescriptor;

    /// Bring the device up. Called once at startup.
    async fn initialize(&self) -> Result<(), DeviceError>;

    /// Drive the device. Read-only adapters keep the default rejection.
    async fn control(&self, _args: Value) -> Result<Value, DeviceError> {
        Err(DeviceError::UnsupportedOperation {
            device: self.name().to_string(),
            operation: Operation::Control,
        })
    }

    /// Read measurements or current state.
    async fn read(&self, _args: Value) -> Result<Value, DeviceError> {
        Err(DeviceError::UnsupportedOperation {
            device: self.name().to_string(),
            operation: Operation::Read,
        })
    }
}

/// Decode call arguments into a typed request.
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, DeviceError> {
    serde_json::from_value(args).map_err(|e| DeviceError::InvalidArguments(e.to_string()))
}
