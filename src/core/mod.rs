//! Queue state machine, execution contract and error taxonomy.

pub mod audit;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod queue_manager;
pub mod store;

pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink};
pub use error::{AppResult, DispatchError, QueueError};
pub use executor::{
    ExecutionClient, RunStatus, RunTicket, SandboxLimits, Spawn, StartRequest, StopAck,
};
pub use experiment::{Experiment, ExperimentPayload, ExperimentState};
pub use queue_manager::{
    CancelOutcome, Enqueued, ExperimentStatus, QueueEntry, QueueManager, QueuePolicy,
    QueueSummary,
};
pub use store::{QueueSnapshot, QueueStore, StoreError};
