//! Event types for the batchflow event bus.
//!
//! `FlowEvent` is broadcast while jobs run. All variants are Clone + Send +
//! Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobInstanceId;
use crate::status::{BatchStatus, ExitStatus};

/// Events emitted during job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// An execution attempt started.
    JobStarted {
        execution_id: Uuid,
        instance_id: JobInstanceId,
        job_name: String,
        attempt: u32,
        start_node: String,
    },

    /// The executor is about to run a node.
    NodeStarted {
        execution_id: Uuid,
        /// Graph the node belongs to (the job itself or a split branch).
        flow: String,
        node: String,
    },

    /// A node returned its exit signal.
    NodeFinished {
        execution_id: Uuid,
        flow: String,
        node: String,
        status: BatchStatus,
        exit: ExitStatus,
        duration_ms: u64,
    },

    /// An execution attempt was sealed.
    JobFinished {
        execution_id: Uuid,
        instance_id: JobInstanceId,
        job_name: String,
        status: BatchStatus,
        exit: ExitStatus,
        duration_ms: u64,
    },
}

impl FlowEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            FlowEvent::JobStarted { execution_id, .. }
            | FlowEvent::NodeStarted { execution_id, .. }
            | FlowEvent::NodeFinished { execution_id, .. }
            | FlowEvent::JobFinished { execution_id, .. } => *execution_id,
        }
    }
}
