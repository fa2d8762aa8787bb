//! Named, registrable jobs.

use std::sync::Arc;

use batchflow_types::execution::ExecutionRecord;
use batchflow_types::job::JobInstanceId;
use batchflow_types::status::{BatchStatus, ExitStatus};
use serde::Serialize;

use crate::flow::graph::FlowGraph;

/// A flow graph registered under a job name.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    name: String,
    graph: Arc<FlowGraph>,
    restartable: bool,
    description: Option<String>,
}

impl JobDefinition {
    /// The job takes its name from the graph.
    pub fn new(graph: FlowGraph) -> Self {
        Self {
            name: graph.name().to_string(),
            graph: Arc::new(graph),
            restartable: true,
            description: None,
        }
    }

    /// Refuse to restart failed or stopped instances of this job.
    pub fn not_restartable(mut self) -> Self {
        self.restartable = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<FlowGraph> {
        &self.graph
    }

    pub fn restartable(&self) -> bool {
        self.restartable
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// What one `run` call produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub instance_id: JobInstanceId,
    pub status: BatchStatus,
    pub exit: ExitStatus,
    pub record: ExecutionRecord,
}

impl JobReport {
    pub fn attempt(&self) -> u32 {
        self.record.attempt
    }

    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Completed
    }
}
