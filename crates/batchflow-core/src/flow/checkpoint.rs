//! Durable checkpointing of execution records plus in-memory snapshots.
//!
//! Wraps `ExecutionRepository` so the executor can persist the record after
//! every node and publish where it currently is for `current_state` queries.

use batchflow_types::execution::{ExecutionRecord, ExecutionSnapshot, FlowState};
use batchflow_types::job::JobInstanceId;
use batchflow_types::status::BatchStatus;
use dashmap::DashMap;

use crate::repository::ExecutionRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists execution records and tracks live snapshots.
///
/// Generic over `R: ExecutionRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.). The record is written before the executor moves
/// past a node, so a crash never loses a completed node.
pub struct CheckpointManager<R: ExecutionRepository> {
    repo: R,
    snapshots: DashMap<JobInstanceId, ExecutionSnapshot>,
}

impl<R: ExecutionRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            snapshots: DashMap::new(),
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist a freshly opened attempt and start tracking its snapshot.
    pub async fn open(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        self.persist(record).await?;
        self.snapshots.insert(
            record.instance_id.clone(),
            ExecutionSnapshot {
                instance_id: record.instance_id.clone(),
                job_name: record.job_name.clone(),
                attempt: record.attempt,
                state: FlowState::Pending,
                current_node: None,
                completed_nodes: Vec::new(),
                last_exit: record.last_exit.clone(),
                status: record.status(),
            },
        );
        tracing::debug!(
            instance = record.instance_id.short(),
            attempt = record.attempt,
            "checkpointed attempt open"
        );
        Ok(())
    }

    /// Move the live snapshot to a new executor state.
    pub fn set_state(&self, instance_id: &JobInstanceId, state: FlowState, node: Option<&str>) {
        if let Some(mut snapshot) = self.snapshots.get_mut(instance_id) {
            snapshot.state = state;
            if let Some(node) = node {
                snapshot.current_node = Some(node.to_string());
            }
        }
    }

    /// Overwrite the reported status, e.g. `STOPPING` once a stop was requested.
    pub fn set_status(&self, instance_id: &JobInstanceId, status: BatchStatus) {
        if let Some(mut snapshot) = self.snapshots.get_mut(instance_id) {
            snapshot.status = status;
        }
    }

    /// Persist the record after a node finished.
    pub async fn checkpoint_node(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        self.persist(record).await?;
        if let Some(mut snapshot) = self.snapshots.get_mut(&record.instance_id) {
            snapshot.completed_nodes = record.completed_nodes.clone();
            snapshot.last_exit = record.last_exit.clone();
        }
        tracing::debug!(
            instance = record.instance_id.short(),
            node = record.last_node.as_deref().unwrap_or_default(),
            "checkpointed node"
        );
        Ok(())
    }

    /// Persist the sealed record and stop tracking the attempt.
    pub async fn seal(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        self.persist(record).await?;
        self.snapshots.remove(&record.instance_id);
        tracing::debug!(
            instance = record.instance_id.short(),
            status = %record.status(),
            "checkpointed seal"
        );
        Ok(())
    }

    pub fn snapshot(&self, instance_id: &JobInstanceId) -> Option<ExecutionSnapshot> {
        self.snapshots.get(instance_id).map(|s| s.clone())
    }

    /// Drop the live snapshot without persisting anything.
    pub fn discard(&self, instance_id: &JobInstanceId) {
        self.snapshots.remove(instance_id);
    }

    async fn persist(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        self.repo
            .append(record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),
}
