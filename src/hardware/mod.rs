//! Device capability layer used by running jobs.
//!
//! Every configured device sits behind a [`DeviceAdapter`]. The
//! [`CapabilityRegistry`] initializes each one independently at startup and
//! the [`HardwareGateway`] routes `{device, operation, args}` calls to it,
//! serializing calls per device and bounding each with a timeout.

pub mod adapter;
pub mod devices;
pub mod gateway;
pub mod legacy;
pub mod registry;

use thiserror::Error;

pub use adapter::{CapabilityDescriptor, DeviceAdapter, DeviceType, Operation};
pub use gateway::{GatewayRequest, GatewayResponse, HardwareGateway};
pub use legacy::LegacyHardwareApi;
pub use registry::{AdapterHandle, CapabilityRegistry, DeviceSlot, DeviceStatus};

/// Errors surfaced by device calls. Never fatal to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device unknown or failed to initialize.
    #[error("device `{0}` is not available")]
    DeviceUnavailable(String),
    /// The adapter does not implement the requested operation.
    #[error("device `{device}` does not support {operation} operations")]
    UnsupportedOperation {
        /// Device name.
        device: String,
        /// Rejected operation.
        operation: Operation,
    },
    /// Arguments were malformed or out of range.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The call did not finish within the operation timeout.
    #[error("device `{device}` did not respond within {timeout_ms} ms")]
    Timeout {
        /// Device name.
        device: String,
        /// Configured bound.
        timeout_ms: u64,
    },
    /// Driver-level failure.
    #[error("driver error: {0}")]
    Driver(String),
}
