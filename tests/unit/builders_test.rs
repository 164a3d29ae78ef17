//! Tests for builder modules

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reactorlab::builders::{build_hub, build_node};
use reactorlab::config::{DeviceConfig, DeviceKind, HubConfig, NodeConfig};
use reactorlab::core::{
    DispatchError, ExecutionClient, ExperimentPayload, RunStatus, RunTicket, StartRequest, StopAck,
};
use reactorlab::runtime::{EnqueueRequest, TokioSpawner};
use reactorlab::util::{now, ExperimentId};

struct IdleClient;

#[async_trait]
impl ExecutionClient for IdleClient {
    async fn start(&self, request: StartRequest) -> Result<RunTicket, DispatchError> {
        Ok(RunTicket {
            experiment_id: request.experiment_id,
            started_at: now(),
            already_running: false,
        })
    }

    async fn poll(&self, _id: &ExperimentId) -> Result<RunStatus, DispatchError> {
        Ok(RunStatus::Running)
    }

    async fn stop(&self, _id: &ExperimentId, _grace: Duration) -> Result<StopAck, DispatchError> {
        Ok(StopAck {
            acknowledged: true,
            was_running: true,
        })
    }
}

#[tokio::test]
async fn test_build_node_reports_failed_devices() {
    let dir = tempfile::tempdir().unwrap();
    let mut broken = DeviceConfig::new("peltier", DeviceKind::Peltier);
    broken.probe_path = Some(PathBuf::from("/nonexistent/i2c-7"));
    let mut disabled = DeviceConfig::new("co2", DeviceKind::Co2);
    disabled.enabled = false;
    let cfg = NodeConfig {
        work_root: dir.path().join("runs"),
        devices: vec![DeviceConfig::new("led", DeviceKind::Led), broken, disabled],
        ..NodeConfig::default()
    };

    let node = build_node(&cfg, TokioSpawner::current()).await.unwrap();
    assert!(cfg.work_root.is_dir());
    assert!(node.registry.is_available("led"));
    assert!(!node.registry.is_available("peltier"));
    let status = node.registry.status();
    assert_eq!(status["co2"].error.as_deref(), Some("disabled"));
    assert_eq!(node.gateway.describe().len(), 1);
    assert!(node.host.health().active_run.is_none());
}

#[test]
fn test_build_hub_persists_to_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HubConfig {
        data_dir: dir.path().join("data"),
        ..HubConfig::default()
    };
    let hub = build_hub(&cfg, Arc::new(IdleClient), None).unwrap();
    let queued = hub
        .api
        .enqueue(EnqueueRequest {
            owner_id: "alice".into(),
            payload: ExperimentPayload::new("print('hi')"),
        })
        .unwrap();
    assert_eq!(queued.queue_position, 0);
    assert!(cfg.data_dir.join("experiment_queue.json").is_file());
    assert!(!hub.shutdown.is_cancelled());
    drop(hub);

    let reopened = build_hub(&cfg, Arc::new(IdleClient), None).unwrap();
    assert_eq!(reopened.queue.list_queue().len(), 1);
}

#[test]
fn test_build_hub_rejects_invalid_config() {
    let cfg = HubConfig {
        tick_ms: 0,
        ..HubConfig::default()
    };
    assert!(build_hub(&cfg, Arc::new(IdleClient), None).is_err());
}
