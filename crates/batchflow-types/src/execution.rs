//! Execution tracking types.
//!
//! `ExecutionRecord` is the durable per-attempt record the history store
//! keeps; restart decisions are made from it alone. `FlowOutcome` is the
//! result of traversing one graph (the job itself or a split branch) and is
//! kept inside the record for every split the attempt visited.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobInstanceId, JobParameters};
use crate::status::{BatchStatus, ExitStatus};

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Job-scoped key/value state shared between nodes.
///
/// Steps never mutate it directly: they return updates which the executor
/// merges after the node completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    values: BTreeMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// String view of a value. Non-string JSON values are rendered as JSON.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overwrite this context with every entry of `other`.
    pub fn merge(&mut self, other: &ExecutionContext) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Flow state & failures
// ---------------------------------------------------------------------------

/// Executor state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Pending,
    RunningNode,
    AwaitingMatch,
    Terminated,
}

/// Engine-classified reason a flow was sealed `FAILED` without a routing
/// transition deciding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowFailure {
    #[error("unresolved transition: node '{node}' exited with '{exit_code}' and no pattern matched")]
    UnresolvedTransition { node: String, exit_code: String },

    #[error("node '{node}' references unregistered step '{step}'")]
    UnknownStep { node: String, step: String },

    #[error("node '{node}' references unregistered decider '{decider}'")]
    UnknownDecider { node: String, decider: String },

    #[error("node visit limit of {limit} exceeded at node '{node}'")]
    VisitLimitExceeded { node: String, limit: u32 },
}

impl FlowFailure {
    pub fn node(&self) -> &str {
        match self {
            FlowFailure::UnresolvedTransition { node, .. }
            | FlowFailure::UnknownStep { node, .. }
            | FlowFailure::UnknownDecider { node, .. }
            | FlowFailure::VisitLimitExceeded { node, .. } => node,
        }
    }
}

// ---------------------------------------------------------------------------
// Node & flow outcomes
// ---------------------------------------------------------------------------

/// What a single node visit produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node: String,
    pub status: BatchStatus,
    pub exit: ExitStatus,
}

/// Terminal result of traversing one flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOutcome {
    /// Name of the graph that was traversed.
    pub flow: String,
    pub status: BatchStatus,
    pub exit: ExitStatus,
    /// Nodes that finished without `FAILED`, in visit order.
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitStatus>,
    /// Where the next attempt of this flow begins. `None` once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FlowFailure>,
    /// Branch outcomes for every split node visited, keyed by split node id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub splits: BTreeMap<String, Vec<FlowOutcome>>,
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// Durable state of one execution attempt of a job instance.
///
/// Created when the attempt starts, updated after every node, and sealed
/// once a terminal condition is reached. A sealed record is never touched
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUIDv7 of this attempt.
    pub execution_id: Uuid,
    pub instance_id: JobInstanceId,
    pub job_name: String,
    /// 1-based attempt number within the instance.
    pub attempt: u32,
    #[serde(default)]
    pub parameters: JobParameters,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitStatus>,
    /// `None` while the attempt is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_status: Option<BatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_exit: Option<ExitStatus>,
    /// Node the next attempt begins at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FlowFailure>,
    /// Per-branch outcomes of every split visited, keyed by split node id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<String, Vec<FlowOutcome>>,
    #[serde(default)]
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Open a new attempt.
    pub fn start(
        instance_id: JobInstanceId,
        job_name: impl Into<String>,
        attempt: u32,
        parameters: JobParameters,
        context: ExecutionContext,
    ) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            instance_id,
            job_name: job_name.into(),
            attempt,
            parameters,
            completed_nodes: Vec::new(),
            last_node: None,
            last_exit: None,
            final_status: None,
            final_exit: None,
            restart_node: None,
            failure: None,
            branches: BTreeMap::new(),
            context,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.final_status.is_some()
    }

    /// Current status: the final status once sealed, `STARTED` before.
    pub fn status(&self) -> BatchStatus {
        self.final_status.unwrap_or(BatchStatus::Started)
    }

    /// Append a node visit. Ignored once sealed.
    pub fn record_node(&mut self, outcome: &NodeOutcome) {
        if self.is_sealed() {
            return;
        }
        if outcome.status != BatchStatus::Failed {
            self.completed_nodes.push(outcome.node.clone());
        }
        self.last_node = Some(outcome.node.clone());
        self.last_exit = Some(outcome.exit.clone());
    }

    /// Seal the record with the outcome of the top-level flow.
    ///
    /// Returns `false` (and changes nothing) if the record was already sealed.
    pub fn seal(&mut self, outcome: &FlowOutcome) -> bool {
        if self.is_sealed() {
            return false;
        }
        self.completed_nodes = outcome.completed_nodes.clone();
        self.last_node = outcome.last_node.clone();
        self.last_exit = outcome.last_exit.clone();
        self.final_status = Some(outcome.status);
        self.final_exit = Some(outcome.exit.clone());
        self.restart_node = outcome.restart_node.clone();
        self.failure = outcome.failure.clone();
        self.branches = outcome.splits.clone();
        self.ended_at = Some(Utc::now());
        true
    }

    /// Seal a record that never reached a terminal transition (e.g. a crashed
    /// attempt) as `ABANDONED`.
    pub fn abandon(&mut self) -> bool {
        if self.is_sealed() {
            return false;
        }
        self.final_status = Some(BatchStatus::Abandoned);
        self.final_exit = Some(ExitStatus::new(BatchStatus::Abandoned.as_str()));
        self.ended_at = Some(Utc::now());
        true
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// In-progress view of a running attempt, for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub instance_id: JobInstanceId,
    pub job_name: String,
    pub attempt: u32,
    pub state: FlowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    pub completed_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitStatus>,
    pub status: BatchStatus,
}
