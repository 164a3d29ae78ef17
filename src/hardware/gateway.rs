//! Routes generic device calls to adapters.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::hardware::adapter::{CapabilityDescriptor, Operation};
use crate::hardware::registry::CapabilityRegistry;
use crate::hardware::DeviceError;

/// Device call as sent by a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Target device.
    pub device_name: String,
    /// `control` or `read`.
    pub operation: Operation,
    /// Device-specific arguments.
    #[serde(default)]
    pub args: Value,
}

/// Reply to a [`GatewayRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayResponse {
    /// Adapter result, verbatim.
    Success {
        /// Returned data.
        data: Value,
    },
    /// Any failure, flattened to a message.
    Error {
        /// Human-readable error.
        message: String,
    },
}

/// Stateless router in front of the [`CapabilityRegistry`].
///
/// Calls to the same device are serialized; calls to different devices run
/// concurrently. Each call, including the wait for the device lock, is
/// bounded by the operation timeout.
#[derive(Clone)]
pub struct HardwareGateway {
    registry: Arc<CapabilityRegistry>,
    op_timeout: Duration,
}

impl HardwareGateway {
    /// Gateway over `registry`.
    pub const fn new(registry: Arc<CapabilityRegistry>, op_timeout: Duration) -> Self {
        Self {
            registry,
            op_timeout,
        }
    }

    /// Underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Discovery listing of initialized devices.
    #[must_use]
    pub fn describe(&self) -> Vec<CapabilityDescriptor> {
        self.registry.describe()
    }

    /// Forward one call to the named device.
    pub async fn invoke(
        &self,
        device: &str,
        operation: Operation,
        args: Value,
    ) -> Result<Value, DeviceError> {
        let handle = self.registry.get(device)?;
        if !handle.descriptor().supports(operation) {
            return Err(DeviceError::UnsupportedOperation {
                device: handle.name().to_string(),
                operation,
            });
        }
        let call = async {
            let _guard = handle.lock.lock().await;
            match operation {
                Operation::Control => handle.adapter.control(args).await,
                Operation::Read => handle.adapter.read(args).await,
            }
        };
        match tokio::time::timeout(self.op_timeout, call).await {
            Ok(result) => {
                if let Err(err) = &result {
                    debug!(device, %operation, error = %err, "device call rejected");
                }
                result
            }
            Err(_) => {
                warn!(device, %operation, "device call timed out");
                Err(DeviceError::Timeout {
                    device: device.to_string(),
                    timeout_ms: u64::try_from(self.op_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Job-facing entry point: every error becomes an error-shaped response.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        match self
            .invoke(&request.device_name, request.operation, request.args)
            .await
        {
            Ok(data) => GatewayResponse::Success { data },
            Err(err) => GatewayResponse::Error {
                message: err.to_string(),
            },
        }
    }
}
