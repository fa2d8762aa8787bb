//! Flow executor: the state machine that walks a flow graph.
//!
//! One `FlowExecutor` serves one execution attempt. It visits a node, turns
//! whatever the node produced into an exit signal, asks the transition
//! matcher where to go, and repeats until a terminal transition, an implicit
//! leaf terminal or an unrecoverable condition seals the flow.
//!
//! # Node boundary
//!
//! Steps, deciders and sub-jobs are collaborators. Errors, panics and
//! timeouts raised by them are caught here and turned into a `FAILED` exit
//! so that configured failure transitions still apply. Nothing a
//! collaborator does escapes the executor as an error; only checkpoint
//! failures do. The step timeout covers steps and deciders; a sub-job runs
//! until its own flow seals.
//!
//! # Cancellation
//!
//! The cancellation token is checked between nodes only. A node that is
//! already running always finishes and its exit is routed; if routing would
//! continue to another node the flow is sealed `STOPPED` instead, with the
//! would-be next node recorded as the restart point. A split that a stop
//! reached inside its branches is sealed `STOPPED` at the split itself, so
//! the stopped branches resume on the next attempt.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use batchflow_types::config::EngineConfig;
use batchflow_types::event::FlowEvent;
use batchflow_types::execution::{
    ExecutionContext, ExecutionRecord, FlowFailure, FlowOutcome, FlowState, NodeOutcome,
};
use batchflow_types::job::{JobInstanceId, JobParameters};
use batchflow_types::status::{BatchStatus, ExitStatus};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::ExecutionRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::decider::DeciderRegistry;
use super::graph::{FlowGraph, FlowNode, NodeKind};
use super::launcher::{BoxJobLauncher, ParameterExtractor};
use super::split;
use super::step::{StepContext, StepRegistry, StepResult};
use super::transition::{NoMatch, Transition, TransitionAction, match_exit};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Identity of the attempt an executor works for.
#[derive(Debug, Clone)]
pub struct AttemptScope {
    pub job_name: String,
    pub instance_id: JobInstanceId,
    pub execution_id: Uuid,
    pub attempt: u32,
    pub parameters: JobParameters,
    /// Sub-job nesting level, 0 for a top-level job.
    pub depth: u8,
}

/// Collaborators the executor dispatches nodes to.
pub struct Collaborators {
    pub steps: StepRegistry,
    pub deciders: DeciderRegistry,
    pub extractor: Arc<dyn ParameterExtractor>,
}

/// Where a traversal begins and what it inherits from an earlier attempt.
#[derive(Debug, Clone)]
pub struct FlowStart {
    pub node: String,
    /// Outcome the first node sees as "previous".
    pub last: Option<NodeOutcome>,
    /// Branch outcomes of the earlier attempt when `node` is a split being resumed.
    pub prior_branches: Option<Vec<FlowOutcome>>,
}

impl FlowStart {
    /// Fresh start at the graph's entry node.
    pub fn entry(graph: &FlowGraph) -> Self {
        Self {
            node: graph.entry().to_string(),
            last: None,
            prior_branches: None,
        }
    }

    /// Resume a flow from the outcome an earlier attempt left behind.
    ///
    /// Falls back to the entry node when no restart node was recorded or the
    /// recorded one is no longer part of the graph.
    pub fn resume(graph: &FlowGraph, previous: &FlowOutcome) -> Self {
        let node = previous
            .restart_node
            .clone()
            .filter(|n| graph.contains(n))
            .unwrap_or_else(|| graph.entry().to_string());
        Self {
            prior_branches: previous.splits.get(&node).cloned(),
            last: last_outcome(previous.last_node.as_deref(), previous.last_exit.as_ref()),
            node,
        }
    }
}

/// Result of traversing one graph to a terminal condition.
#[derive(Debug, Clone)]
pub struct Traversal {
    pub outcome: FlowOutcome,
    /// Context as it stood when the flow terminated.
    pub context: ExecutionContext,
    /// Entries written while traversing this graph.
    pub updates: ExecutionContext,
}

/// What one node visit produced, before routing.
#[derive(Debug, Clone)]
pub(crate) struct NodeRun {
    pub status: BatchStatus,
    pub exit: ExitStatus,
    pub updates: ExecutionContext,
    pub branches: Option<Vec<FlowOutcome>>,
    pub failure: Option<FlowFailure>,
}

impl NodeRun {
    pub(crate) fn new(status: BatchStatus, exit: ExitStatus) -> Self {
        Self {
            status,
            exit,
            updates: ExecutionContext::new(),
            branches: None,
            failure: None,
        }
    }

    fn from_result(result: StepResult) -> Self {
        Self {
            updates: result.context_updates,
            ..Self::new(result.status, result.exit)
        }
    }

    fn failed(description: impl Into<String>) -> Self {
        Self::new(
            BatchStatus::Failed,
            ExitStatus::failed().with_description(description),
        )
    }

    fn failure(failure: FlowFailure) -> Self {
        Self {
            failure: Some(failure.clone()),
            ..Self::failed(failure.to_string())
        }
    }
}

/// Status a decision node reports for the exit code its decider returned.
pub fn status_for_exit(exit: &ExitStatus) -> BatchStatus {
    match exit.code.as_str() {
        ExitStatus::FAILED => BatchStatus::Failed,
        ExitStatus::STOPPED => BatchStatus::Stopped,
        ExitStatus::UNKNOWN => BatchStatus::Unknown,
        _ => BatchStatus::Completed,
    }
}

pub(crate) fn last_outcome(node: Option<&str>, exit: Option<&ExitStatus>) -> Option<NodeOutcome> {
    match (node, exit) {
        (Some(node), Some(exit)) => Some(NodeOutcome {
            node: node.to_string(),
            status: status_for_exit(exit),
            exit: exit.clone(),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Traversal bookkeeping
// ---------------------------------------------------------------------------

/// Mutable state of a single traversal. Turned into a `FlowOutcome` once a
/// terminal condition is reached.
struct TraversalState {
    flow: String,
    context: ExecutionContext,
    updates: ExecutionContext,
    completed: Vec<String>,
    last: Option<NodeOutcome>,
    splits: BTreeMap<String, Vec<FlowOutcome>>,
}

impl TraversalState {
    fn new(flow: &str, context: ExecutionContext, last: Option<NodeOutcome>) -> Self {
        Self {
            flow: flow.to_string(),
            context,
            updates: ExecutionContext::new(),
            completed: Vec::new(),
            last,
            splits: BTreeMap::new(),
        }
    }

    /// Fold a finished node visit into the traversal.
    fn apply(&mut self, node: &str, run: NodeRun) -> NodeOutcome {
        self.context.merge(&run.updates);
        self.updates.merge(&run.updates);
        if let Some(branches) = run.branches {
            self.splits.insert(node.to_string(), branches);
        }
        let outcome = NodeOutcome {
            node: node.to_string(),
            status: run.status,
            exit: run.exit,
        };
        if outcome.status != BatchStatus::Failed {
            self.completed.push(node.to_string());
        }
        self.last = Some(outcome.clone());
        outcome
    }

    fn finish(
        &self,
        status: BatchStatus,
        exit: ExitStatus,
        restart: Option<String>,
        failure: Option<FlowFailure>,
    ) -> FlowOutcome {
        FlowOutcome {
            flow: self.flow.clone(),
            status,
            exit,
            completed_nodes: self.completed.clone(),
            last_node: self.last.as_ref().map(|o| o.node.clone()),
            last_exit: self.last.as_ref().map(|o| o.exit.clone()),
            restart_node: restart.filter(|_| status.is_restartable()),
            failure,
            splits: self.splits.clone(),
        }
    }

    fn last_description(&self) -> String {
        self.last
            .as_ref()
            .map(|o| o.exit.description.clone())
            .unwrap_or_default()
    }

    /// Seal according to a matched terminal transition.
    fn terminal(&self, node: &str, transition: &Transition) -> FlowOutcome {
        let (status, code, restart) = match &transition.action {
            TransitionAction::End => (BatchStatus::Completed, ExitStatus::COMPLETED, node.to_string()),
            TransitionAction::Fail => (BatchStatus::Failed, ExitStatus::FAILED, node.to_string()),
            TransitionAction::Stop { restart } => (BatchStatus::Stopped, ExitStatus::STOPPED, restart.clone()),
            TransitionAction::Continue { target } => {
                (BatchStatus::Completed, ExitStatus::COMPLETED, target.clone())
            }
        };
        let status = transition.status.unwrap_or(status);
        let code = transition.exit_code.clone().unwrap_or_else(|| code.to_string());
        let exit = ExitStatus::new(code).with_description(self.last_description());
        self.finish(status, exit, Some(restart), None)
    }

    /// Seal a node with no outgoing transitions.
    fn implicit_terminal(&self, node: &str) -> FlowOutcome {
        let (status, exit) = match &self.last {
            Some(last) if last.exit.is_failed() || last.status.is_unsuccessful() => {
                (BatchStatus::Failed, last.exit.clone())
            }
            Some(last) if last.exit.code == ExitStatus::STOPPED => (BatchStatus::Stopped, last.exit.clone()),
            Some(last) => (BatchStatus::Completed, last.exit.clone()),
            None => (BatchStatus::Completed, ExitStatus::completed()),
        };
        self.finish(status, exit, Some(node.to_string()), None)
    }

    fn unresolved(&self, node: &str, no_match: NoMatch) -> FlowOutcome {
        let exit = ExitStatus::failed().with_description(no_match.to_string());
        let failure = FlowFailure::UnresolvedTransition {
            node: node.to_string(),
            exit_code: no_match.exit_code,
        };
        self.finish(BatchStatus::Failed, exit, Some(node.to_string()), Some(failure))
    }

    fn engine_failure(&self, node: &str, failure: FlowFailure) -> FlowOutcome {
        let exit = ExitStatus::failed().with_description(failure.to_string());
        self.finish(BatchStatus::Failed, exit, Some(node.to_string()), Some(failure))
    }

    fn stop_requested(&self, resume: String) -> FlowOutcome {
        let exit = ExitStatus::stopped().with_description("stop requested");
        self.finish(BatchStatus::Stopped, exit, Some(resume), None)
    }
}

// ---------------------------------------------------------------------------
// FlowExecutor
// ---------------------------------------------------------------------------

/// Walks flow graphs for one execution attempt.
///
/// Generic over `R: ExecutionRepository` for storage flexibility. Cloning is
/// cheap (shared collaborators) and clones share the cancellation token, which
/// is how split branches inherit a stop request.
pub struct FlowExecutor<R: ExecutionRepository> {
    collaborators: Arc<Collaborators>,
    checkpoint: Arc<CheckpointManager<R>>,
    launcher: Option<Arc<BoxJobLauncher>>,
    config: Arc<EngineConfig>,
    events: EventBus,
    cancel: CancellationToken,
    scope: Arc<AttemptScope>,
}

impl<R: ExecutionRepository> Clone for FlowExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            collaborators: Arc::clone(&self.collaborators),
            checkpoint: Arc::clone(&self.checkpoint),
            launcher: self.launcher.clone(),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            scope: Arc::clone(&self.scope),
        }
    }
}

impl<R: ExecutionRepository + 'static> FlowExecutor<R> {
    pub fn new(
        collaborators: Arc<Collaborators>,
        checkpoint: Arc<CheckpointManager<R>>,
        config: Arc<EngineConfig>,
        events: EventBus,
        scope: AttemptScope,
    ) -> Self {
        Self {
            collaborators,
            checkpoint,
            launcher: None,
            config,
            events,
            cancel: CancellationToken::new(),
            scope: Arc::new(scope),
        }
    }

    /// Enable `SubJob` nodes.
    pub fn with_launcher(mut self, launcher: Arc<BoxJobLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn scope(&self) -> &AttemptScope {
        &self.scope
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the attempt: traverse `graph` from `start`, checkpointing into
    /// `record` after every node, then seal and persist the record.
    pub async fn execute(
        &self,
        graph: Arc<FlowGraph>,
        start: FlowStart,
        record: &mut ExecutionRecord,
    ) -> Result<FlowOutcome, ExecutorError> {
        let context = record.context.clone();
        let traversal = self.traverse(graph, start, context, Some(&mut *record)).await?;

        record.context = traversal.context;
        record.seal(&traversal.outcome);
        self.checkpoint.seal(record).await?;
        Ok(traversal.outcome)
    }

    /// Traverse one graph until it terminates.
    ///
    /// With `record` present this is the job's own flow: state changes are
    /// published to the snapshot and the record is checkpointed after every
    /// node. Split branches traverse without a record.
    ///
    /// Boxed because splits recurse into it from spawned tasks.
    pub fn traverse<'a>(
        &'a self,
        graph: Arc<FlowGraph>,
        start: FlowStart,
        context: ExecutionContext,
        mut record: Option<&'a mut ExecutionRecord>,
    ) -> BoxFuture<'a, Result<Traversal, ExecutorError>> {
        Box::pin(async move {
            let tracked = record.is_some();
            let mut state = TraversalState::new(graph.name(), context, start.last);
            let mut prior_branches = start.prior_branches;
            let mut current = start.node;
            let mut visits: u32 = 0;

            self.publish_state(tracked, FlowState::Pending, None);

            let outcome = loop {
                let Some(node) = graph.node(&current) else {
                    return Err(ExecutorError::UnknownNode {
                        flow: graph.name().to_string(),
                        node: current,
                    });
                };

                visits += 1;
                if visits > self.config.max_node_visits {
                    let failure = FlowFailure::VisitLimitExceeded {
                        node: current.clone(),
                        limit: self.config.max_node_visits,
                    };
                    break state.engine_failure(&current, failure);
                }

                self.publish_state(tracked, FlowState::RunningNode, Some(&current));
                self.events.publish(FlowEvent::NodeStarted {
                    execution_id: self.scope.execution_id,
                    flow: graph.name().to_string(),
                    node: current.clone(),
                });

                let started = Instant::now();
                let run = self
                    .run_node(&graph, node, &state.context, state.last.as_ref(), prior_branches.take())
                    .await;

                tracing::debug!(
                    job = self.scope.job_name.as_str(),
                    flow = graph.name(),
                    node = current.as_str(),
                    status = %run.status,
                    exit_code = run.exit.code.as_str(),
                    "node finished"
                );
                self.events.publish(FlowEvent::NodeFinished {
                    execution_id: self.scope.execution_id,
                    flow: graph.name().to_string(),
                    node: current.clone(),
                    status: run.status,
                    exit: run.exit.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });

                let failure = run.failure.clone();
                let branch_stopped = run.branches.as_deref().is_some_and(split::any_stopped);
                let outcome = state.apply(&current, run);
                if let Some(record) = record.as_deref_mut() {
                    record.record_node(&outcome);
                    record.context = state.context.clone();
                    record.branches = state.splits.clone();
                    self.checkpoint.checkpoint_node(record).await?;
                }

                if let Some(failure) = failure {
                    break state.engine_failure(&current, failure);
                }

                self.publish_state(tracked, FlowState::AwaitingMatch, None);

                if self.cancel.is_cancelled()
                    && (outcome.status == BatchStatus::Stopped || branch_stopped)
                {
                    break state.stop_requested(current.clone());
                }

                if node.is_leaf() {
                    break state.implicit_terminal(&current);
                }

                let transition = match match_exit(&outcome.exit.code, &node.transitions) {
                    Ok(transition) => transition,
                    Err(no_match) => {
                        tracing::warn!(
                            job = self.scope.job_name.as_str(),
                            flow = graph.name(),
                            node = current.as_str(),
                            exit_code = outcome.exit.code.as_str(),
                            "no transition matches exit code"
                        );
                        break state.unresolved(&current, no_match);
                    }
                };

                match &transition.action {
                    TransitionAction::Continue { target } => {
                        if self.cancel.is_cancelled() {
                            break state.stop_requested(target.clone());
                        }
                        current = target.clone();
                    }
                    _ => break state.terminal(&current, transition),
                }
            };

            self.publish_state(tracked, FlowState::Terminated, None);
            tracing::debug!(
                job = self.scope.job_name.as_str(),
                flow = graph.name(),
                status = %outcome.status,
                exit_code = outcome.exit.code.as_str(),
                restart_node = outcome.restart_node.as_deref().unwrap_or_default(),
                "flow terminated"
            );

            Ok(Traversal {
                outcome,
                context: state.context,
                updates: state.updates,
            })
        })
    }

    /// Dispatch one node by kind.
    async fn run_node(
        &self,
        graph: &FlowGraph,
        node: &FlowNode,
        context: &ExecutionContext,
        last: Option<&NodeOutcome>,
        prior_branches: Option<Vec<FlowOutcome>>,
    ) -> NodeRun {
        match &node.kind {
            NodeKind::Step { step } => {
                let Some(unit) = self.collaborators.steps.get(step) else {
                    return NodeRun::failure(FlowFailure::UnknownStep {
                        node: node.id.clone(),
                        step: step.clone(),
                    });
                };
                let ctx = self.step_context(graph, node, context, last);
                match self.guarded(unit.execute(&ctx)).await {
                    Ok(result) => NodeRun::from_result(result),
                    Err(message) => {
                        tracing::warn!(
                            job = self.scope.job_name.as_str(),
                            node = node.id.as_str(),
                            step = step.as_str(),
                            error = message.as_str(),
                            "step failed"
                        );
                        NodeRun::failed(message)
                    }
                }
            }
            NodeKind::Decision { decider } => {
                let Some(unit) = self.collaborators.deciders.get(decider) else {
                    return NodeRun::failure(FlowFailure::UnknownDecider {
                        node: node.id.clone(),
                        decider: decider.clone(),
                    });
                };
                let ctx = self.step_context(graph, node, context, last);
                match self.guarded(unit.decide(&ctx)).await {
                    Ok(exit) => NodeRun::new(status_for_exit(&exit), exit),
                    Err(message) => {
                        tracing::warn!(
                            job = self.scope.job_name.as_str(),
                            node = node.id.as_str(),
                            decider = decider.as_str(),
                            error = message.as_str(),
                            "decider failed"
                        );
                        NodeRun::failed(message)
                    }
                }
            }
            NodeKind::Split { branches } => {
                split::run_split(self, &node.id, branches, context, prior_branches).await
            }
            NodeKind::SubJob {
                job,
                parameter_keys,
            } => self.run_sub_job(&node.id, job, parameter_keys, context).await,
        }
    }

    async fn run_sub_job(
        &self,
        node: &str,
        job: &str,
        parameter_keys: &[String],
        context: &ExecutionContext,
    ) -> NodeRun {
        let Some(launcher) = &self.launcher else {
            return NodeRun::failed(format!("no job launcher available for sub-job '{job}'"));
        };
        let depth = self.scope.depth.saturating_add(1);
        if depth > self.config.max_sub_job_depth {
            tracing::warn!(node, job, depth, "sub-job depth limit reached");
            return NodeRun::failed(format!(
                "sub-job depth limit of {} reached",
                self.config.max_sub_job_depth
            ));
        }

        let parameters =
            self.collaborators
                .extractor
                .extract(context, &self.scope.parameters, parameter_keys);
        // No node timeout here: the child's own nodes are timed, and dropping
        // the launch mid-flight would leave the child's attempt unsealed.
        match self.bounded(launcher.launch(job, parameters, depth), None).await {
            Ok(launched) => {
                tracing::debug!(
                    node,
                    job,
                    instance = launched.instance_id.short(),
                    status = %launched.status,
                    "sub-job finished"
                );
                NodeRun::new(launched.status, launched.exit)
            }
            Err(message) => {
                tracing::warn!(node, job, error = message.as_str(), "sub-job launch failed");
                NodeRun::failed(message)
            }
        }
    }

    /// Run a collaborator future under the node boundary: errors, panics and
    /// the optional timeout all become an error message.
    async fn guarded<T, F>(&self, fut: F) -> Result<T, String>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.bounded(fut, self.config.step_timeout_secs).await
    }

    async fn bounded<T, F>(&self, fut: F, timeout_secs: Option<u64>) -> Result<T, String>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let fut = AssertUnwindSafe(fut).catch_unwind();
        let result = match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), fut).await {
                Ok(result) => result,
                Err(_) => return Err(format!("timed out after {secs}s")),
            },
            None => fut.await,
        };
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(payload) => Err(panic_message(payload.as_ref())),
        }
    }

    fn step_context(
        &self,
        graph: &FlowGraph,
        node: &FlowNode,
        context: &ExecutionContext,
        last: Option<&NodeOutcome>,
    ) -> StepContext {
        StepContext {
            job_name: self.scope.job_name.clone(),
            instance_id: self.scope.instance_id.clone(),
            execution_id: self.scope.execution_id,
            attempt: self.scope.attempt,
            flow: graph.name().to_string(),
            node: node.id.clone(),
            parameters: self.scope.parameters.clone(),
            context: context.clone(),
            last: last.cloned(),
        }
    }

    fn publish_state(&self, tracked: bool, state: FlowState, node: Option<&str>) {
        if tracked {
            self.checkpoint
                .set_state(&self.scope.instance_id, state, node);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that abort an attempt without sealing it.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("flow '{flow}' has no node '{node}'")]
    UnknownNode { flow: String, node: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::launcher::ContextParameterExtractor;
    use crate::flow::transition::Transition;
    use crate::repository::InMemoryExecutionRepository;
    use crate::testing::{Journal, ScriptedStep};

    fn executor(steps: StepRegistry) -> FlowExecutor<InMemoryExecutionRepository> {
        let params = JobParameters::new();
        FlowExecutor::new(
            Arc::new(Collaborators {
                steps,
                deciders: DeciderRegistry::new(),
                extractor: Arc::new(ContextParameterExtractor),
            }),
            Arc::new(CheckpointManager::new(InMemoryExecutionRepository::new())),
            Arc::new(EngineConfig::default()),
            EventBus::new(16),
            AttemptScope {
                job_name: "job".to_string(),
                instance_id: JobInstanceId::derive("job", &params),
                execution_id: Uuid::now_v7(),
                attempt: 1,
                parameters: params,
                depth: 0,
            },
        )
    }

    fn branch() -> FlowGraph {
        FlowGraph::builder("branch")
            .step("read", "read", vec![Transition::to("*", "write")])
            .step("write", "write", vec![Transition::end("*")])
            .build()
            .unwrap()
    }

    #[test]
    fn decision_status_follows_exit_code() {
        assert_eq!(status_for_exit(&ExitStatus::failed()), BatchStatus::Failed);
        assert_eq!(status_for_exit(&ExitStatus::stopped()), BatchStatus::Stopped);
        assert_eq!(status_for_exit(&ExitStatus::unknown()), BatchStatus::Unknown);
        assert_eq!(status_for_exit(&ExitStatus::new("LARGE")), BatchStatus::Completed);
    }

    #[tokio::test]
    async fn untracked_traversal_collects_updates() {
        let journal = Journal::default();
        let mut steps = StepRegistry::new();
        steps.register(ScriptedStep::new("read", &journal, |_, _| {
            Ok(StepResult::completed().with_update("read", 3))
        }));
        steps.register(ScriptedStep::new("write", &journal, |_, ctx| {
            assert_eq!(ctx.last.as_ref().map(|l| l.node.as_str()), Some("read"));
            assert_eq!(ctx.flow, "branch");
            Ok(StepResult::completed().with_update("written", 3))
        }));
        let exec = executor(steps);
        let graph = Arc::new(branch());

        let mut base = ExecutionContext::new();
        base.insert("batch", "b-1");
        let traversal = exec
            .traverse(Arc::clone(&graph), FlowStart::entry(&graph), base, None)
            .await
            .unwrap();

        assert_eq!(traversal.outcome.status, BatchStatus::Completed);
        assert_eq!(traversal.outcome.completed_nodes, vec!["read", "write"]);
        assert!(traversal.outcome.restart_node.is_none());
        assert_eq!(traversal.context.len(), 3);
        assert_eq!(traversal.updates.len(), 2);
        assert!(!traversal.updates.contains_key("batch"));
        // Untracked traversals never publish a snapshot.
        assert!(exec.checkpoint.snapshot(&exec.scope().instance_id).is_none());
    }

    #[test]
    fn resume_uses_recorded_restart_node() {
        let graph = branch();
        let previous = FlowOutcome {
            flow: "branch".to_string(),
            status: BatchStatus::Failed,
            exit: ExitStatus::failed(),
            completed_nodes: vec!["read".to_string()],
            last_node: Some("write".to_string()),
            last_exit: Some(ExitStatus::failed()),
            restart_node: Some("write".to_string()),
            failure: None,
            splits: Default::default(),
        };
        let start = FlowStart::resume(&graph, &previous);
        assert_eq!(start.node, "write");
        assert_eq!(start.last.unwrap().status, BatchStatus::Failed);

        let lost = FlowOutcome {
            restart_node: Some("renamed".to_string()),
            ..previous
        };
        assert_eq!(FlowStart::resume(&graph, &lost).node, "read");
    }

    #[tokio::test]
    async fn starting_at_missing_node_is_an_error() {
        let exec = executor(StepRegistry::new());
        let graph = Arc::new(branch());
        let start = FlowStart {
            node: "nowhere".to_string(),
            last: None,
            prior_branches: None,
        };
        let err = exec
            .traverse(graph, start, ExecutionContext::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownNode { ref node, .. } if node == "nowhere"));
    }

    #[tokio::test]
    async fn sub_job_without_launcher_fails_node() {
        let exec = executor(StepRegistry::new());
        let graph = Arc::new(
            FlowGraph::builder("job")
                .sub_job("child", "other", vec![], vec![Transition::end("*")])
                .build()
                .unwrap(),
        );
        let traversal = exec
            .traverse(Arc::clone(&graph), FlowStart::entry(&graph), ExecutionContext::new(), None)
            .await
            .unwrap();
        // `*` still matches FAILED, so the flow ends normally.
        assert_eq!(traversal.outcome.status, BatchStatus::Completed);
        let last = traversal.outcome.last_exit.unwrap();
        assert_eq!(last.code, ExitStatus::FAILED);
        assert!(last.description.contains("no job launcher"));
    }
}
