//! Infrastructure adapters: queue storage backends and execution transports.

pub mod execution;
pub mod store;

pub use execution::InProcessExecutionClient;
pub use store::{InMemoryStore, JsonFileStore};
