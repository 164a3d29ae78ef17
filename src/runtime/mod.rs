//! Runtime pieces: spawner, background dispatch loop, execution host and API surface.

pub mod api;
pub mod dispatch;
pub mod host;
pub mod shutdown;
pub mod tokio_spawner;

pub use api::{
    ApiError, ControlCommand, ControlResponse, EnqueueRequest, EnqueueResponse, Health, QueueApi,
};
pub use dispatch::{DispatchConfig, DispatchWorker};
pub use host::{ExecutionHost, HostError, NodeHealth, RunSummary};
pub use shutdown::ShutdownToken;
pub use tokio_spawner::TokioSpawner;
