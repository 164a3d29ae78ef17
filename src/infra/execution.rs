//! In-process execution client.
//!
//! Calls an [`ExecutionHost`] directly instead of going over the network,
//! while keeping the timeout and error semantics a remote transport has.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::core::{
    DispatchError, ExecutionClient, RunStatus, RunTicket, Spawn, StartRequest, StopAck,
};
use crate::runtime::host::ExecutionHost;
use crate::util::ExperimentId;

/// [`ExecutionClient`] bound to a host in the same process.
pub struct InProcessExecutionClient<S> {
    host: Arc<ExecutionHost<S>>,
    timeout: Duration,
}

impl<S> InProcessExecutionClient<S> {
    /// Client with a per-call timeout.
    pub const fn new(host: Arc<ExecutionHost<S>>, timeout: Duration) -> Self {
        Self { host, timeout }
    }
}

async fn bounded<T>(
    call: &'static str,
    limit: Duration,
    fut: impl Future<Output = T> + Send,
) -> Result<T, DispatchError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        warn!(call, timeout_ms = limit.as_millis(), "execution host call timed out");
        DispatchError::DispatchFailure(format!("{call} timed out after {limit:?}"))
    })
}

#[async_trait]
impl<S> ExecutionClient for InProcessExecutionClient<S>
where
    S: Spawn + Send + Sync + 'static,
{
    async fn start(&self, request: StartRequest) -> Result<RunTicket, DispatchError> {
        let host = Arc::clone(&self.host);
        bounded("start", self.timeout, async move { host.start(request) }).await?
    }

    async fn poll(&self, id: &ExperimentId) -> Result<RunStatus, DispatchError> {
        bounded("poll", self.timeout, async { self.host.poll(id) }).await
    }

    async fn stop(&self, id: &ExperimentId, grace: Duration) -> Result<StopAck, DispatchError> {
        bounded("stop", self.timeout + grace, self.host.stop(id, grace)).await
    }
}
