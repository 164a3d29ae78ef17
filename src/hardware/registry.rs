//! One entry per configured device, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::hardware::adapter::{CapabilityDescriptor, DeviceAdapter};
use crate::hardware::DeviceError;

/// A configured device handed to the registry.
pub struct DeviceSlot {
    /// The adapter instance.
    pub adapter: Arc<dyn DeviceAdapter>,
    /// Disabled devices are recorded but never initialized.
    pub enabled: bool,
}

impl DeviceSlot {
    /// Enabled slot.
    pub fn enabled(adapter: Arc<dyn DeviceAdapter>) -> Self {
        Self {
            adapter,
            enabled: true,
        }
    }

    /// Disabled slot.
    pub fn disabled(adapter: Arc<dyn DeviceAdapter>) -> Self {
        Self {
            adapter,
            enabled: false,
        }
    }
}

/// Availability of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the device came up.
    pub initialized: bool,
    /// Why it did not.
    pub error: Option<String>,
}

struct DeviceEntry {
    descriptor: CapabilityDescriptor,
    status: DeviceStatus,
    adapter: Arc<dyn DeviceAdapter>,
    lock: Arc<AsyncMutex<()>>,
}

/// Routable reference to an initialized device.
#[derive(Clone)]
pub struct AdapterHandle {
    pub(crate) adapter: Arc<dyn DeviceAdapter>,
    pub(crate) lock: Arc<AsyncMutex<()>>,
    descriptor: CapabilityDescriptor,
}

impl AdapterHandle {
    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Capability descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }
}

/// Name-keyed device table. Immutable after [`CapabilityRegistry::initialize`].
pub struct CapabilityRegistry {
    entries: BTreeMap<String, DeviceEntry>,
}

impl CapabilityRegistry {
    /// Initialize every enabled device independently.
    ///
    /// A device that errors or exceeds `init_timeout` is recorded with
    /// `initialized = false`; the remaining devices are still brought up.
    pub async fn initialize(slots: Vec<DeviceSlot>, init_timeout: Duration) -> Self {
        let mut entries = BTreeMap::new();
        for slot in slots {
            let name = slot.adapter.name().to_string();
            if entries.contains_key(&name) {
                warn!(device = %name, "duplicate device name; ignoring later entry");
                continue;
            }
            let status = if slot.enabled {
                match tokio::time::timeout(init_timeout, slot.adapter.initialize()).await {
                    Ok(Ok(())) => {
                        info!(device = %name, "device initialized");
                        DeviceStatus {
                            initialized: true,
                            error: None,
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(device = %name, error = %err, "device failed to initialize");
                        DeviceStatus {
                            initialized: false,
                            error: Some(err.to_string()),
                        }
                    }
                    Err(_) => {
                        warn!(device = %name, timeout_ms = init_timeout.as_millis(), "device initialization timed out");
                        DeviceStatus {
                            initialized: false,
                            error: Some("initialization timed out".into()),
                        }
                    }
                }
            } else {
                info!(device = %name, "device disabled by configuration");
                DeviceStatus {
                    initialized: false,
                    error: Some("disabled".into()),
                }
            };
            entries.insert(
                name,
                DeviceEntry {
                    descriptor: slot.adapter.describe(),
                    status,
                    adapter: slot.adapter,
                    lock: Arc::new(AsyncMutex::new(())),
                },
            );
        }
        let ready = entries.values().filter(|e| e.status.initialized).count();
        info!(ready, configured = entries.len(), "capability registry ready");
        Self { entries }
    }

    /// Descriptors of initialized devices only.
    #[must_use]
    pub fn describe(&self) -> Vec<CapabilityDescriptor> {
        self.entries
            .values()
            .filter(|e| e.status.initialized)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Look up an initialized device.
    pub fn get(&self, name: &str) -> Result<AdapterHandle, DeviceError> {
        match self.entries.get(name) {
            Some(entry) if entry.status.initialized => Ok(AdapterHandle {
                adapter: Arc::clone(&entry.adapter),
                lock: Arc::clone(&entry.lock),
                descriptor: entry.descriptor.clone(),
            }),
            _ => Err(DeviceError::DeviceUnavailable(name.to_string())),
        }
    }

    /// Whether `name` is configured and initialized.
    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| e.status.initialized)
    }

    /// Status of every configured device, including failed and disabled ones.
    #[must_use]
    pub fn status(&self) -> BTreeMap<String, DeviceStatus> {
        self.entries
            .iter()
            .map(|(name, e)| (name.clone(), e.status.clone()))
            .collect()
    }
}
