//! Builders that assemble the hub and the execution node from configuration.

pub mod hub_builder;
pub mod node_builder;

pub use hub_builder::{build_hub, Hub};
pub use node_builder::{build_adapter, build_node, Node};
