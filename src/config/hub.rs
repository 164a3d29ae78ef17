//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{env_value, invalid, process_env, ConfigError};
use crate::config::node::validate_limits;
use crate::core::{QueuePolicy, SandboxLimits};
use crate::runtime::dispatch::DispatchConfig;

/// Queue, dispatch and persistence settings of the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Directory holding `experiment_queue.json`.
    pub data_dir: PathBuf,
    /// Maximum active experiments per owner.
    pub max_active_per_owner: usize,
    /// Age after which terminal experiments are swept, in seconds.
    pub retention_secs: u64,
    /// Periodic sweep interval in seconds; the sweep always runs once at startup.
    pub cleanup_interval_secs: Option<u64>,
    /// Dispatch tick in milliseconds.
    pub tick_ms: u64,
    /// Bound on each call to the execution host, in seconds.
    pub call_timeout_secs: u64,
    /// Transient failures tolerated per experiment.
    pub max_dispatch_retries: u32,
    /// Base retry delay in milliseconds.
    pub retry_backoff_ms: u64,
    /// Grace granted to a running experiment on cancel, in seconds.
    pub cancel_grace_secs: u64,
    /// Limits sent with each start.
    pub limits: SandboxLimits,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_active_per_owner: 5,
            retention_secs: 24 * 60 * 60,
            cleanup_interval_secs: None,
            tick_ms: 2_000,
            call_timeout_secs: 10,
            max_dispatch_retries: 3,
            retry_backoff_ms: 1_000,
            cancel_grace_secs: 30,
            limits: SandboxLimits::default(),
        }
    }
}

impl HubConfig {
    /// Validate value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_per_owner == 0 {
            return Err(invalid("max_active_per_owner must be greater than 0"));
        }
        if self.tick_ms == 0 {
            return Err(invalid("tick_ms must be greater than 0"));
        }
        if self.call_timeout_secs == 0 {
            return Err(invalid("call_timeout_secs must be greater than 0"));
        }
        if self.cleanup_interval_secs == Some(0) {
            return Err(invalid("cleanup_interval_secs must be greater than 0 when set"));
        }
        validate_limits(&self.limits)
    }

    /// Parse hub configuration from a JSON string and validate.
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
        if let Some(v) = env_value::<PathBuf>(&lookup, "DATA_DIR")? {
            cfg.data_dir = v;
        }
        if let Some(v) = env_value(&lookup, "MAX_ACTIVE_PER_OWNER")? {
            cfg.max_active_per_owner = v;
        }
        if let Some(v) = env_value(&lookup, "RETENTION_SECS")? {
            cfg.retention_secs = v;
        }
        if let Some(v) = env_value(&lookup, "CLEANUP_INTERVAL_SECS")? {
            cfg.cleanup_interval_secs = Some(v);
        }
        if let Some(v) = env_value(&lookup, "TICK_MS")? {
            cfg.tick_ms = v;
        }
        if let Some(v) = env_value(&lookup, "CALL_TIMEOUT_SECS")? {
            cfg.call_timeout_secs = v;
        }
        if let Some(v) = env_value(&lookup, "MAX_DISPATCH_RETRIES")? {
            cfg.max_dispatch_retries = v;
        }
        if let Some(v) = env_value(&lookup, "CANCEL_GRACE_SECS")? {
            cfg.cancel_grace_secs = v;
        }
        if let Some(v) = env_value(&lookup, "DEADLINE_SECS")? {
            cfg.limits.deadline_secs = v;
        }
        if let Some(v) = env_value(&lookup, "MEMORY_BYTES")? {
            cfg.limits.memory_bytes = v;
        }
        if let Some(v) = env_value(&lookup, "CPU_SHARE")? {
            cfg.limits.cpu_share = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Quota and retention for the queue manager.
    #[must_use]
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_active_per_owner: self.max_active_per_owner,
            retention: Duration::from_secs(self.retention_secs),
        }
    }

    /// Timeout applied to each execution-host call.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Dispatch loop settings.
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            tick: Duration::from_millis(self.tick_ms),
            max_retries: self.max_dispatch_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            cleanup_interval: self.cleanup_interval_secs.map(Duration::from_secs),
            limits: self.limits.clone(),
        }
    }
}
