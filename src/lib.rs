//! # reactorlab
//!
//! Remote execution of user-submitted experiment scripts on a bioreactor.
//!
//! Two halves cooperate:
//!
//! - **Hub**: a durable FIFO of experiments with per-owner quotas, queue
//!   control (cancel, pause, resume, reorder, run-now), and a dispatch loop
//!   that keeps at most one experiment RUNNING and drives it through the
//!   execution contract (start, poll, stop) with retries and restart recovery.
//! - **Node**: sandboxed execution of one script at a time (clean
//!   environment, own process group, wall-clock deadline, optional cgroup
//!   limits) plus a hardware gateway that serializes device calls per device.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reactorlab::builders::{build_hub, build_node};
//! use reactorlab::config::{HubConfig, NodeConfig};
//! use reactorlab::infra::InProcessExecutionClient;
//! use reactorlab::runtime::TokioSpawner;
//!
//! let node = build_node(&NodeConfig::from_env()?, TokioSpawner::current()).await?;
//! let hub_cfg = HubConfig::from_env()?;
//! let client = Arc::new(InProcessExecutionClient::new(node.host.clone(), hub_cfg.call_timeout()));
//! let hub = build_hub(&hub_cfg, client, None)?;
//! hub.worker.spawn(&TokioSpawner::current());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Experiment model, queue manager and the execution contract.
pub mod core;
/// Hub and node configuration.
pub mod config;
/// Assembly of the hub and the node from configuration.
pub mod builders;
/// Persistence backends and execution clients.
pub mod infra;
/// Dispatch loop, execution host and API handlers.
pub mod runtime;
/// Shared utilities.
pub mod util;
/// Device adapters, capability registry and gateway.
pub mod hardware;
/// Process sandbox for experiment scripts.
pub mod sandbox;
