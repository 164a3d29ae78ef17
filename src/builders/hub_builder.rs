//! Assemble the orchestrator hub: durable queue, API and dispatch loop.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::HubConfig;
use crate::core::{AppResult, AuditSink, ExecutionClient, QueueManager};
use crate::infra::store::JsonFileStore;
use crate::runtime::api::QueueApi;
use crate::runtime::dispatch::DispatchWorker;
use crate::runtime::shutdown::ShutdownToken;
use crate::util::clock::now;

/// The assembled hub. Spawn `worker` and serve `api`.
pub struct Hub<C> {
    /// Shared queue state.
    pub queue: Arc<QueueManager<JsonFileStore>>,
    /// Request handlers.
    pub api: QueueApi<JsonFileStore>,
    /// Dispatch loop, not yet started.
    pub worker: DispatchWorker<JsonFileStore, C>,
    /// Stops the dispatch loop.
    pub shutdown: ShutdownToken,
}

/// Validate `cfg`, load the queue from `data_dir` and sweep expired experiments.
pub fn build_hub<C: ExecutionClient>(
    cfg: &HubConfig,
    client: Arc<C>,
    audit: Option<Box<dyn AuditSink>>,
) -> AppResult<Hub<C>> {
    cfg.validate().context("hub configuration invalid")?;
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;

    let store = JsonFileStore::in_dir(&cfg.data_dir);
    let path = store.path().to_path_buf();
    let queue = QueueManager::open_with_audit(store, cfg.policy(), audit)
        .with_context(|| format!("opening queue at {}", path.display()))?;
    let queue = Arc::new(queue);
    let swept = queue
        .cleanup_expired(now())
        .context("startup retention sweep")?;

    let shutdown = ShutdownToken::new();
    let worker = DispatchWorker::new(
        Arc::clone(&queue),
        client,
        cfg.dispatch_config(),
        shutdown.clone(),
    );
    info!(store = %path.display(), swept, "hub ready");
    Ok(Hub {
        api: QueueApi::new(Arc::clone(&queue)),
        queue,
        worker,
        shutdown,
    })
}
