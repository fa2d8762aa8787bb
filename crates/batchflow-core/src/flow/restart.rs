//! Restart resolution: decide where a new attempt of a job instance begins.
//!
//! The decision is made from the latest persisted record only. A sealed
//! `FAILED` or `STOPPED` attempt resumes at its recorded restart node; the
//! node that failed is re-run, nodes before it are not.

use batchflow_types::execution::{ExecutionContext, ExecutionRecord, FlowOutcome, NodeOutcome};
use batchflow_types::job::JobInstanceId;
use batchflow_types::status::BatchStatus;

use super::executor::{FlowStart, last_outcome};
use super::graph::FlowGraph;

/// Where and how the next attempt starts.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPoint {
    pub node: String,
    /// 1 for a fresh instance.
    pub attempt: u32,
    pub context: ExecutionContext,
    pub last: Option<NodeOutcome>,
    /// Branch outcomes to reuse when `node` is a split.
    pub prior_branches: Option<Vec<FlowOutcome>>,
}

impl StartPoint {
    pub fn fresh(graph: &FlowGraph) -> Self {
        Self {
            node: graph.entry().to_string(),
            attempt: 1,
            context: ExecutionContext::new(),
            last: None,
            prior_branches: None,
        }
    }

    pub fn is_restart(&self) -> bool {
        self.attempt > 1
    }

    pub fn flow_start(&self) -> FlowStart {
        FlowStart {
            node: self.node.clone(),
            last: self.last.clone(),
            prior_branches: self.prior_branches.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RestartError {
    #[error("job instance {instance} finished {status} and cannot be restarted")]
    NotRestartable {
        instance: JobInstanceId,
        status: BatchStatus,
    },

    #[error("job '{job}' does not allow restarts")]
    RestartDisabled { job: String },

    #[error("job instance {instance} attempt {attempt} has not finished")]
    AlreadyRunning { instance: JobInstanceId, attempt: u32 },

    #[error("restart node '{node}' is not part of flow '{flow}'")]
    UnknownRestartNode { flow: String, node: String },
}

/// Resolve the start point for a job instance given its latest record.
///
/// `restartable` is the job definition's restart flag; it only matters when
/// there is a previous attempt to restart.
pub fn resolve_start(
    latest: Option<&ExecutionRecord>,
    graph: &FlowGraph,
    restartable: bool,
) -> Result<StartPoint, RestartError> {
    let Some(record) = latest else {
        return Ok(StartPoint::fresh(graph));
    };

    if !record.is_sealed() {
        return Err(RestartError::AlreadyRunning {
            instance: record.instance_id.clone(),
            attempt: record.attempt,
        });
    }

    let status = record.status();
    if !status.is_restartable() {
        return Err(RestartError::NotRestartable {
            instance: record.instance_id.clone(),
            status,
        });
    }
    if !restartable {
        return Err(RestartError::RestartDisabled {
            job: record.job_name.clone(),
        });
    }

    let node = record
        .restart_node
        .clone()
        .or_else(|| record.last_node.clone())
        .unwrap_or_else(|| graph.entry().to_string());
    if !graph.contains(&node) {
        return Err(RestartError::UnknownRestartNode {
            flow: graph.name().to_string(),
            node,
        });
    }

    tracing::debug!(
        instance = record.instance_id.short(),
        previous = %status,
        node = node.as_str(),
        attempt = record.attempt + 1,
        "resolved restart point"
    );

    Ok(StartPoint {
        prior_branches: record.branches.get(&node).cloned(),
        last: last_outcome(record.last_node.as_deref(), record.last_exit.as_ref()),
        context: record.context.clone(),
        attempt: record.attempt + 1,
        node,
    })
}
