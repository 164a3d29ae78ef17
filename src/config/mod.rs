//! Configuration models for the orchestrator hub and the execution node.

pub mod hub;
pub mod node;

use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

pub use hub::HubConfig;
pub use node::{DeviceConfig, DeviceKind, NodeConfig};

/// Prefix of every environment variable read by `from_env`.
pub const ENV_PREFIX: &str = "REACTORLAB_";

/// Configuration parse and validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Input was not valid JSON for the target type.
    #[error("parse error: {0}")]
    Parse(String),
    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// An environment variable could not be parsed.
    #[error("invalid value for {var}: {message}")]
    Env {
        /// Full variable name.
        var: String,
        /// Parse failure.
        message: String,
    },
}

pub(crate) fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Read `REACTORLAB_<key>` through `lookup` and parse it.
pub(crate) fn env_value<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let var = format!("{ENV_PREFIX}{key}");
    lookup(&var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Env {
                var: var.clone(),
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Process environment after loading `.env` when present.
pub(crate) fn process_env() -> impl Fn(&str) -> Option<String> {
    let _ = dotenvy::dotenv();
    |key: &str| std::env::var(key).ok()
}
