//! Job runner: the public entry point of the engine.
//!
//! Resolves the start point of each attempt from persisted history, opens a
//! new execution record, drives a [`FlowExecutor`] over the job's graph and
//! seals the result. The runner also launches sub-jobs, so a `SubJob` node is
//! just a nested `run` at a deeper level.

use std::sync::Arc;
use std::time::Instant;

use batchflow_types::config::EngineConfig;
use batchflow_types::error::RepositoryError;
use batchflow_types::event::FlowEvent;
use batchflow_types::execution::{ExecutionRecord, ExecutionSnapshot, FlowState};
use batchflow_types::job::{JobInstanceId, JobParameters};
use batchflow_types::status::BatchStatus;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::event::EventBus;
use crate::flow::checkpoint::{CheckpointError, CheckpointManager};
use crate::flow::decider::DeciderRegistry;
use crate::flow::executor::{AttemptScope, BoxFuture, Collaborators, ExecutorError, FlowExecutor};
use crate::flow::launcher::{
    BoxJobLauncher, ContextParameterExtractor, JobLauncher, LaunchOutcome, ParameterExtractor,
};
use crate::flow::restart::{RestartError, resolve_start};
use crate::flow::step::StepRegistry;
use crate::repository::ExecutionRepository;

use super::definition::{JobDefinition, JobReport};

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error("job instance {0} is already running")]
    AlreadyRunning(JobInstanceId),

    #[error("no execution recorded for job instance {0}")]
    NoExecution(JobInstanceId),

    #[error("execution history error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct JobRunnerBuilder<R: ExecutionRepository> {
    repo: R,
    steps: StepRegistry,
    deciders: DeciderRegistry,
    extractor: Arc<dyn ParameterExtractor>,
    config: EngineConfig,
    events: Option<EventBus>,
}

impl<R: ExecutionRepository + 'static> JobRunnerBuilder<R> {
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn deciders(mut self, deciders: DeciderRegistry) -> Self {
        self.deciders = deciders;
        self
    }

    /// Replace the default [`ContextParameterExtractor`].
    pub fn extractor(mut self, extractor: impl ParameterExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish to an existing bus instead of creating one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> JobRunner<R> {
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));
        JobRunner {
            jobs: Arc::new(DashMap::new()),
            collaborators: Arc::new(Collaborators {
                steps: self.steps,
                deciders: self.deciders,
                extractor: self.extractor,
            }),
            checkpoint: Arc::new(CheckpointManager::new(self.repo)),
            running: Arc::new(DashMap::new()),
            events,
            config: Arc::new(self.config),
        }
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Runs registered jobs against an execution history.
///
/// Cloning is cheap; clones share the registry, the history and the set of
/// running instances.
pub struct JobRunner<R: ExecutionRepository> {
    jobs: Arc<DashMap<String, Arc<JobDefinition>>>,
    collaborators: Arc<Collaborators>,
    checkpoint: Arc<CheckpointManager<R>>,
    running: Arc<DashMap<JobInstanceId, CancellationToken>>,
    events: EventBus,
    config: Arc<EngineConfig>,
}

impl<R: ExecutionRepository> Clone for JobRunner<R> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            collaborators: Arc::clone(&self.collaborators),
            checkpoint: Arc::clone(&self.checkpoint),
            running: Arc::clone(&self.running),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<R: ExecutionRepository + 'static> JobRunner<R> {
    pub fn builder(repo: R) -> JobRunnerBuilder<R> {
        JobRunnerBuilder {
            repo,
            steps: StepRegistry::new(),
            deciders: DeciderRegistry::new(),
            extractor: Arc::new(ContextParameterExtractor),
            config: EngineConfig::default(),
            events: None,
        }
    }

    /// Register a job, replacing any previous definition of the same name.
    pub fn register(&self, definition: JobDefinition) {
        tracing::debug!(
            job = definition.name(),
            nodes = definition.graph().len(),
            "registered job"
        );
        self.jobs
            .insert(definition.name().to_string(), Arc::new(definition));
    }

    pub fn job(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(name).map(|d| Arc::clone(&d))
    }

    /// Registered jobs, sorted by name.
    pub fn jobs(&self) -> Vec<Arc<JobDefinition>> {
        let mut jobs: Vec<Arc<JobDefinition>> =
            self.jobs.iter().map(|d| Arc::clone(d.value())).collect();
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        jobs
    }

    pub fn instance_id(&self, job: &str, parameters: &JobParameters) -> JobInstanceId {
        JobInstanceId::derive(job, parameters)
    }

    pub fn events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run (or restart) the job instance identified by `job` and the
    /// identifying subset of `parameters`, and wait for it to terminate.
    pub async fn run(&self, job: &str, parameters: JobParameters) -> Result<JobReport, JobError> {
        self.run_at_depth(job, parameters, 0).await
    }

    /// Boxed so that sub-job launches can recurse into it.
    fn run_at_depth<'a>(
        &'a self,
        job: &'a str,
        parameters: JobParameters,
        depth: u8,
    ) -> BoxFuture<'a, Result<JobReport, JobError>> {
        Box::pin(async move {
            let definition = self
                .job(job)
                .ok_or_else(|| JobError::UnknownJob(job.to_string()))?;
            let instance_id = JobInstanceId::derive(definition.name(), &parameters);

            let token = CancellationToken::new();
            let _claim = match self.running.entry(instance_id.clone()) {
                Entry::Occupied(_) => return Err(JobError::AlreadyRunning(instance_id)),
                Entry::Vacant(slot) => {
                    slot.insert(token.clone());
                    RunClaim {
                        running: Arc::clone(&self.running),
                        checkpoint: Arc::clone(&self.checkpoint),
                        instance_id: instance_id.clone(),
                    }
                }
            };

            self.run_claimed(&definition, instance_id, parameters, depth, token)
                .await
        })
    }

    async fn run_claimed(
        &self,
        definition: &JobDefinition,
        instance_id: JobInstanceId,
        parameters: JobParameters,
        depth: u8,
        token: CancellationToken,
    ) -> Result<JobReport, JobError> {
        let latest = self.checkpoint.repo().load_latest(&instance_id).await?;
        let start = resolve_start(latest.as_ref(), definition.graph(), definition.restartable())?;

        let mut record = ExecutionRecord::start(
            instance_id.clone(),
            definition.name(),
            start.attempt,
            parameters.clone(),
            start.context.clone(),
        );
        self.checkpoint.open(&record).await?;

        tracing::info!(
            job = definition.name(),
            instance = instance_id.short(),
            attempt = start.attempt,
            start_node = start.node.as_str(),
            depth,
            "starting job execution"
        );
        self.events.publish(FlowEvent::JobStarted {
            execution_id: record.execution_id,
            instance_id: instance_id.clone(),
            job_name: definition.name().to_string(),
            attempt: start.attempt,
            start_node: start.node.clone(),
        });

        let scope = AttemptScope {
            job_name: definition.name().to_string(),
            instance_id: instance_id.clone(),
            execution_id: record.execution_id,
            attempt: start.attempt,
            parameters,
            depth,
        };
        let executor = FlowExecutor::new(
            Arc::clone(&self.collaborators),
            Arc::clone(&self.checkpoint),
            Arc::clone(&self.config),
            self.events.clone(),
            scope,
        )
        .with_cancellation(token)
        .with_launcher(Arc::new(BoxJobLauncher::new(self.clone())));

        let started = Instant::now();
        let outcome = match executor
            .execute(Arc::clone(definition.graph()), start.flow_start(), &mut record)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    job = definition.name(),
                    instance = instance_id.short(),
                    error = %e,
                    "job execution aborted"
                );
                return Err(e.into());
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.events.publish(FlowEvent::JobFinished {
            execution_id: record.execution_id,
            instance_id: instance_id.clone(),
            job_name: definition.name().to_string(),
            status: outcome.status,
            exit: outcome.exit.clone(),
            duration_ms,
        });
        tracing::info!(
            job = definition.name(),
            instance = instance_id.short(),
            attempt = record.attempt,
            status = %outcome.status,
            exit_code = outcome.exit.code.as_str(),
            duration_ms,
            "job execution finished"
        );

        Ok(JobReport {
            instance_id,
            status: outcome.status,
            exit: outcome.exit,
            record,
        })
    }

    /// Where an instance is right now.
    ///
    /// A running attempt reports its live snapshot; otherwise the latest
    /// persisted record is reported as terminated. `None` if the instance
    /// has never run.
    pub async fn current_state(
        &self,
        instance_id: &JobInstanceId,
    ) -> Result<Option<ExecutionSnapshot>, JobError> {
        if let Some(snapshot) = self.checkpoint.snapshot(instance_id) {
            return Ok(Some(snapshot));
        }
        let latest = self.checkpoint.repo().load_latest(instance_id).await?;
        Ok(latest.map(|record| ExecutionSnapshot {
            state: if record.is_sealed() {
                FlowState::Terminated
            } else {
                FlowState::Pending
            },
            current_node: record.last_node.clone(),
            status: record.status(),
            instance_id: record.instance_id,
            job_name: record.job_name,
            attempt: record.attempt,
            completed_nodes: record.completed_nodes,
            last_exit: record.last_exit,
        }))
    }

    /// Request a running instance to stop at the next node boundary.
    ///
    /// Returns `false` if the instance is not running in this process.
    pub fn stop(&self, instance_id: &JobInstanceId) -> bool {
        let Some(token) = self.running.get(instance_id).map(|t| t.clone()) else {
            return false;
        };
        token.cancel();
        self.checkpoint.set_status(instance_id, BatchStatus::Stopping);
        tracing::info!(instance = instance_id.short(), "stop requested");
        true
    }

    /// Mark an instance as never to be restarted.
    ///
    /// An unsealed latest attempt (left behind by a crash) is sealed
    /// `ABANDONED` in place. A sealed `FAILED` or `STOPPED` attempt is left
    /// untouched and an `ABANDONED` attempt is appended after it.
    pub async fn abandon(&self, instance_id: &JobInstanceId) -> Result<ExecutionRecord, JobError> {
        if self.running.contains_key(instance_id) {
            return Err(JobError::AlreadyRunning(instance_id.clone()));
        }

        let repo = self.checkpoint.repo();
        let mut latest = repo
            .load_latest(instance_id)
            .await?
            .ok_or_else(|| JobError::NoExecution(instance_id.clone()))?;

        let record = if latest.abandon() {
            latest
        } else {
            let status = latest.status();
            if !status.is_restartable() {
                return Err(RestartError::NotRestartable {
                    instance: instance_id.clone(),
                    status,
                }
                .into());
            }
            let mut marker = ExecutionRecord::start(
                instance_id.clone(),
                latest.job_name.clone(),
                latest.attempt + 1,
                latest.parameters.clone(),
                latest.context.clone(),
            );
            marker.abandon();
            marker
        };

        repo.append(&record).await?;
        tracing::info!(
            job = record.job_name.as_str(),
            instance = instance_id.short(),
            attempt = record.attempt,
            "abandoned job instance"
        );
        Ok(record)
    }

    /// Every attempt of an instance, oldest first.
    pub async fn history(&self, instance_id: &JobInstanceId) -> Result<Vec<ExecutionRecord>, JobError> {
        Ok(self.checkpoint.repo().list(instance_id).await?)
    }

    /// Most recent attempts across all instances, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ExecutionRecord>, JobError> {
        Ok(self.checkpoint.repo().list_recent(limit).await?)
    }
}

/// An instance's entry in the running set.
///
/// Released on drop, so the instance is free again even when the future
/// driving it is dropped before it finishes. A record left unsealed that way
/// is treated like one left by a crash and has to be abandoned.
struct RunClaim<R: ExecutionRepository> {
    running: Arc<DashMap<JobInstanceId, CancellationToken>>,
    checkpoint: Arc<CheckpointManager<R>>,
    instance_id: JobInstanceId,
}

impl<R: ExecutionRepository> Drop for RunClaim<R> {
    fn drop(&mut self) {
        self.running.remove(&self.instance_id);
        self.checkpoint.discard(&self.instance_id);
    }
}

impl<R: ExecutionRepository + 'static> JobLauncher for JobRunner<R> {
    async fn launch(
        &self,
        job: &str,
        parameters: JobParameters,
        depth: u8,
    ) -> anyhow::Result<LaunchOutcome> {
        let report = self.run_at_depth(job, parameters, depth).await?;
        Ok(LaunchOutcome {
            instance_id: report.instance_id,
            status: report.status,
            exit: report.exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::flow::graph::FlowGraph;
    use crate::flow::step::StepResult;
    use crate::flow::transition::Transition;
    use crate::repository::InMemoryExecutionRepository;
    use crate::testing::{GateStep, Journal, KeyDecider, ScriptedStep, SlowStep, runner};
    use batchflow_types::execution::FlowFailure;
    use batchflow_types::status::ExitStatus;

    fn steps(list: Vec<ScriptedStep>) -> StepRegistry {
        let mut registry = StepRegistry::new();
        for step in list {
            registry.register(step);
        }
        registry
    }

    fn linear(name: &str, nodes: &[&str], last: Vec<Transition>) -> FlowGraph {
        let mut builder = FlowGraph::builder(name);
        for pair in nodes.windows(2) {
            builder = builder.step(
                pair[0],
                pair[0],
                vec![
                    Transition::fail(ExitStatus::FAILED),
                    Transition::to("*", pair[1]),
                ],
            );
        }
        let tail = nodes[nodes.len() - 1];
        builder.step(tail, tail, last).build().unwrap()
    }

    fn single(
        steps: StepRegistry,
        graph: FlowGraph,
    ) -> JobRunner<InMemoryExecutionRepository> {
        let runner = runner(steps, DeciderRegistry::new(), EngineConfig::default());
        runner.register(JobDefinition::new(graph));
        runner
    }

    #[tokio::test]
    async fn linear_job_completes() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![
                ScriptedStep::completes("a", &journal),
                ScriptedStep::completes("b", &journal),
            ]),
            linear("job", &["a", "b"], vec![Transition::end("*")]),
        );

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.exit.code, ExitStatus::COMPLETED);
        assert_eq!(report.record.completed_nodes, vec!["a", "b"]);
        assert!(report.record.restart_node.is_none());
        assert_eq!(journal.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stop_transition_restarts_at_declared_node() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::completes("a", &journal),
            ScriptedStep::new("b", &journal, |call, _| {
                if call == 1 {
                    Ok(StepResult::completed().with_exit_code("PAUSE"))
                } else {
                    Ok(StepResult::completed())
                }
            }),
            ScriptedStep::completes("c", &journal),
        ]);
        let graph = FlowGraph::builder("job")
            .step("a", "a", vec![Transition::to("*", "b")])
            .step(
                "b",
                "b",
                vec![Transition::stop("PAUSE", "b"), Transition::to("*", "c")],
            )
            .step("c", "c", vec![Transition::end("*")])
            .build()
            .unwrap();
        let runner = single(registry, graph);

        let first = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Stopped);
        assert_eq!(first.exit.code, ExitStatus::STOPPED);
        assert_eq!(first.record.restart_node.as_deref(), Some("b"));

        let second = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.attempt(), 2);
        assert_eq!(journal.calls(), vec!["a", "b", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_node_is_rerun_and_earlier_nodes_are_not() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![
                ScriptedStep::completes("a", &journal),
                ScriptedStep::fails_once("b", &journal),
                ScriptedStep::completes("c", &journal),
            ]),
            linear("job", &["a", "b", "c"], vec![Transition::end("*")]),
        );

        let first = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(first.record.completed_nodes, vec!["a"]);
        assert_eq!(first.record.last_node.as_deref(), Some("b"));
        assert_eq!(first.record.restart_node.as_deref(), Some("b"));

        let second = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(journal.count("a"), 1);
        assert_eq!(journal.count("b"), 2);
        assert_eq!(journal.count("c"), 1);

        let history = runner.history(&first.instance_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status(), BatchStatus::Failed);
        assert_eq!(history[1].status(), BatchStatus::Completed);
    }

    #[tokio::test]
    async fn completed_instance_is_not_run_again() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![ScriptedStep::completes("a", &journal)]),
            linear("job", &["a"], vec![]),
        );
        let params = JobParameters::new().with("date", "2024-01-01");

        runner.run("job", params.clone()).await.unwrap();
        let err = runner.run("job", params).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Restart(RestartError::NotRestartable {
                status: BatchStatus::Completed,
                ..
            })
        ));
        assert_eq!(journal.count("a"), 1);

        // Different identifying parameters are a different instance.
        runner
            .run("job", JobParameters::new().with("date", "2024-01-02"))
            .await
            .unwrap();
        assert_eq!(journal.count("a"), 2);
    }

    #[tokio::test]
    async fn non_identifying_parameters_share_an_instance() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![ScriptedStep::completes("a", &journal)]),
            linear("job", &["a"], vec![]),
        );

        runner
            .run("job", JobParameters::new().with_option("run.id", "1"))
            .await
            .unwrap();
        let err = runner
            .run("job", JobParameters::new().with_option("run.id", "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Restart(_)));
    }

    #[tokio::test]
    async fn restart_disabled_job_refuses_after_failure() {
        let journal = Journal::default();
        let runner = runner(
            steps(vec![ScriptedStep::fails_once("a", &journal)]),
            DeciderRegistry::new(),
            EngineConfig::default(),
        );
        runner.register(JobDefinition::new(linear("job", &["a"], vec![])).not_restartable());

        let first = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        let err = runner.run("job", JobParameters::new()).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Restart(RestartError::RestartDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn unmatched_exit_code_fails_with_unresolved_transition() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::exits("a", &journal, "WEIRD"),
            ScriptedStep::completes("b", &journal),
        ]);
        let graph = FlowGraph::builder("job")
            .step("a", "a", vec![Transition::to(ExitStatus::COMPLETED, "b")])
            .step("b", "b", vec![])
            .build()
            .unwrap();
        let runner = single(registry, graph);

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(
            report.record.failure,
            Some(FlowFailure::UnresolvedTransition {
                node: "a".to_string(),
                exit_code: "WEIRD".to_string(),
            })
        );
        assert_eq!(report.record.last_node.as_deref(), Some("a"));
        assert_eq!(report.record.restart_node.as_deref(), Some("a"));
        assert_eq!(journal.count("b"), 0);
    }

    #[tokio::test]
    async fn step_error_and_panic_follow_failure_transitions() {
        for failing in ["error", "panic"] {
            let journal = Journal::default();
            let registry = steps(vec![
                ScriptedStep::new("work", &journal, move |_, _| {
                    if failing == "panic" {
                        panic!("kaboom");
                    }
                    Err(anyhow::anyhow!("disk full"))
                }),
                ScriptedStep::completes("recover", &journal),
            ]);
            let graph = FlowGraph::builder("job")
                .step(
                    "work",
                    "work",
                    vec![
                        Transition::to(ExitStatus::FAILED, "recover"),
                        Transition::end("*"),
                    ],
                )
                .step("recover", "recover", vec![])
                .build()
                .unwrap();
            let runner = single(registry, graph);
            let mut events = runner.events();

            let report = runner.run("job", JobParameters::new()).await.unwrap();
            assert_eq!(report.status, BatchStatus::Completed, "{failing}");
            assert_eq!(journal.calls(), vec!["work", "recover"], "{failing}");

            let mut work_exit = None;
            while let Ok(event) = events.try_recv() {
                if let FlowEvent::NodeFinished { node, exit, status, .. } = event {
                    if node == "work" {
                        assert_eq!(status, BatchStatus::Failed);
                        work_exit = Some(exit);
                    }
                }
            }
            let work_exit = work_exit.unwrap();
            assert_eq!(work_exit.code, ExitStatus::FAILED);
            let expected = if failing == "panic" { "kaboom" } else { "disk full" };
            assert!(work_exit.description.contains(expected), "{}", work_exit.description);
        }
    }

    #[tokio::test]
    async fn unregistered_step_fails_the_flow() {
        let runner = single(StepRegistry::new(), linear("job", &["ghost"], vec![]));

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(matches!(
            report.record.failure,
            Some(FlowFailure::UnknownStep { ref step, .. }) if step == "ghost"
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_rejected() {
        let runner = runner(StepRegistry::new(), DeciderRegistry::new(), EngineConfig::default());
        let err = runner.run("missing", JobParameters::new()).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownJob(ref name) if name == "missing"));
    }

    #[tokio::test]
    async fn leaf_node_terminates_with_its_own_exit() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![ScriptedStep::exits("a", &journal, "CUSTOM")]),
            linear("job", &["a"], vec![]),
        );

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.exit.code, "CUSTOM");
    }

    #[tokio::test]
    async fn end_transition_applies_overrides() {
        let journal = Journal::default();
        let registry = steps(vec![ScriptedStep::exits("a", &journal, "EMPTY")]);
        let graph = FlowGraph::builder("job")
            .step(
                "a",
                "a",
                vec![
                    Transition::end("EMPTY")
                        .with_exit_code("NOTHING_TO_DO")
                        .with_status(BatchStatus::Stopped),
                    Transition::end("*"),
                ],
            )
            .build()
            .unwrap();
        let runner = single(registry, graph);

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Stopped);
        assert_eq!(report.exit.code, "NOTHING_TO_DO");
        assert_eq!(report.record.restart_node.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn decision_routes_on_decider_exit() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::new("load", &journal, |_, _| {
                Ok(StepResult::completed().with_update("route", "FAST"))
            }),
            ScriptedStep::completes("fast", &journal),
            ScriptedStep::completes("slow", &journal),
        ]);
        let mut deciders = DeciderRegistry::new();
        deciders.register(KeyDecider {
            name: "router".to_string(),
            key: "route".to_string(),
            journal: journal.clone(),
        });
        let graph = FlowGraph::builder("job")
            .step("load", "load", vec![Transition::to("*", "choose")])
            .decision(
                "choose",
                "router",
                vec![Transition::to("FAST", "fast"), Transition::to("*", "slow")],
            )
            .step("fast", "fast", vec![])
            .step("slow", "slow", vec![])
            .build()
            .unwrap();
        let runner = runner(registry, deciders, EngineConfig::default());
        runner.register(JobDefinition::new(graph));

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(journal.calls(), vec!["load", "router", "fast"]);
        assert_eq!(report.record.completed_nodes, vec!["load", "choose", "fast"]);
    }

    #[tokio::test]
    async fn decider_sees_previous_node_outcome() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::exits("load", &journal, "PARTIAL"),
            ScriptedStep::completes("fix", &journal),
        ]);
        let mut deciders = DeciderRegistry::new();
        deciders.register(KeyDecider {
            name: "router".to_string(),
            key: "unset".to_string(),
            journal: journal.clone(),
        });
        let graph = FlowGraph::builder("job")
            .step("load", "load", vec![Transition::to("*", "choose")])
            .decision(
                "choose",
                "router",
                vec![Transition::to("AFTER_PARTIAL", "fix"), Transition::end("*")],
            )
            .step("fix", "fix", vec![])
            .build()
            .unwrap();
        let runner = runner(registry, deciders, EngineConfig::default());
        runner.register(JobDefinition::new(graph));

        runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(journal.count("fix"), 1);
    }

    #[tokio::test]
    async fn context_updates_survive_restart() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::new("count", &journal, |_, _| {
                Ok(StepResult::completed().with_update("rows", 10))
            }),
            ScriptedStep::new("write", &journal, |call, ctx| {
                if call == 1 {
                    return Ok(StepResult::failed("target locked"));
                }
                assert!(ctx.is_restart());
                assert_eq!(ctx.context.get("rows"), Some(&serde_json::json!(10)));
                Ok(StepResult::completed())
            }),
        ]);
        let runner = single(registry, linear("job", &["count", "write"], vec![]));

        let first = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(first.record.context.get("rows"), Some(&serde_json::json!(10)));

        let second = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(journal.count("count"), 1);
    }

    /// A split of single-step branches followed by leaf steps named `tails`.
    fn fan_out(branches: &[(&str, &str)], transitions: Vec<Transition>, tails: &[&str]) -> FlowGraph {
        let branches = branches
            .iter()
            .map(|(flow, step)| {
                FlowGraph::builder(*flow)
                    .step(*step, *step, vec![])
                    .build()
                    .unwrap()
            })
            .collect();
        let mut builder = FlowGraph::builder("job").split("fan", branches, transitions);
        for tail in tails {
            builder = builder.step(*tail, *tail, vec![]);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn failed_branch_routes_split_failure_transition() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::completes("one", &journal),
            ScriptedStep::new("two", &journal, |_, _| Ok(StepResult::failed("bad row"))),
            ScriptedStep::completes("three", &journal),
            ScriptedStep::completes("cleanup", &journal),
            ScriptedStep::completes("done", &journal),
        ]);
        let graph = fan_out(
            &[("b1", "one"), ("b2", "two"), ("b3", "three")],
            vec![
                Transition::to(ExitStatus::FAILED, "cleanup"),
                Transition::to("*", "done"),
            ],
            &["cleanup", "done"],
        );
        let runner = single(registry, graph);

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        for step in ["one", "two", "three", "cleanup"] {
            assert_eq!(journal.count(step), 1, "{step}");
        }
        assert_eq!(journal.count("done"), 0);

        let branches = &report.record.branches["fan"];
        let flows: Vec<&str> = branches.iter().map(|b| b.flow.as_str()).collect();
        assert_eq!(flows, vec!["b1", "b2", "b3"]);
        assert_eq!(branches[1].status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn completed_branches_are_not_rerun_on_restart() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::completes("one", &journal),
            ScriptedStep::fails_once("two", &journal),
            ScriptedStep::completes("done", &journal),
        ]);
        let graph = fan_out(
            &[("b1", "one"), ("b2", "two")],
            vec![Transition::fail(ExitStatus::FAILED), Transition::to("*", "done")],
            &["done"],
        );
        let runner = single(registry, graph);

        let first = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(first.record.restart_node.as_deref(), Some("fan"));

        let second = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(journal.count("one"), 1);
        assert_eq!(journal.count("two"), 2);
        assert_eq!(journal.count("done"), 1);
    }

    #[tokio::test]
    async fn bounded_split_still_runs_every_branch() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::completes("one", &journal),
            ScriptedStep::completes("two", &journal),
            ScriptedStep::completes("three", &journal),
            ScriptedStep::completes("done", &journal),
        ]);
        let config = EngineConfig {
            max_parallel_branches: 1,
            ..EngineConfig::default()
        };
        let runner = runner(registry, DeciderRegistry::new(), config);
        runner.register(JobDefinition::new(fan_out(
            &[("b1", "one"), ("b2", "two"), ("b3", "three")],
            vec![Transition::to(ExitStatus::COMPLETED, "done"), Transition::fail("*")],
            &["done"],
        )));

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(journal.count("done"), 1);
        assert_eq!(journal.calls().len(), 4);
    }

    #[tokio::test]
    async fn sub_job_failure_is_routable_in_parent() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::new("extract", &journal, |_, ctx| {
                assert_eq!(ctx.parameters.get("batch"), Some("7"));
                Ok(StepResult::failed("source offline"))
            }),
            ScriptedStep::completes("alert", &journal),
        ]);
        let runner = runner(registry, DeciderRegistry::new(), EngineConfig::default());
        runner.register(JobDefinition::new(linear("child", &["extract"], vec![])));
        runner.register(JobDefinition::new(
            FlowGraph::builder("parent")
                .sub_job(
                    "load",
                    "child",
                    vec!["batch".to_string()],
                    vec![
                        Transition::to(ExitStatus::FAILED, "alert"),
                        Transition::end("*"),
                    ],
                )
                .step("alert", "alert", vec![])
                .build()
                .unwrap(),
        ));

        let report = runner
            .run("parent", JobParameters::new().with("batch", "7"))
            .await
            .unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(journal.calls(), vec!["extract", "alert"]);

        let child = runner.instance_id("child", &JobParameters::new().with("batch", "7"));
        let history = runner.history(&child).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status(), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn recursive_sub_jobs_stop_at_depth_limit() {
        let journal = Journal::default();
        let registry = steps(vec![ScriptedStep::new("bump", &journal, |_, ctx| {
            let level: u32 = ctx
                .parameters
                .get("level")
                .and_then(|l| l.parse().ok())
                .unwrap_or_default();
            Ok(StepResult::completed().with_update("level", (level + 1).to_string()))
        })]);
        let runner = runner(registry, DeciderRegistry::new(), EngineConfig::default());
        runner.register(JobDefinition::new(
            FlowGraph::builder("recurse")
                .step("bump", "bump", vec![Transition::to("*", "nest")])
                .sub_job("nest", "recurse", vec!["level".to_string()], vec![])
                .build()
                .unwrap(),
        ));

        let report = runner
            .run("recurse", JobParameters::new().with("level", "0"))
            .await
            .unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        // Top level plus five nested levels.
        assert_eq!(journal.count("bump"), 6);
    }

    #[tokio::test]
    async fn node_visit_limit_fails_cycles() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::completes("ping", &journal),
            ScriptedStep::completes("pong", &journal),
        ]);
        let graph = FlowGraph::builder("job")
            .step("ping", "ping", vec![Transition::to("*", "pong")])
            .step("pong", "pong", vec![Transition::to("*", "ping")])
            .build()
            .unwrap();
        let config = EngineConfig {
            max_node_visits: 5,
            ..EngineConfig::default()
        };
        let runner = runner(registry, DeciderRegistry::new(), config);
        runner.register(JobDefinition::new(graph));

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(matches!(
            report.record.failure,
            Some(FlowFailure::VisitLimitExceeded { limit: 5, .. })
        ));
        assert_eq!(journal.calls().len(), 5);
    }

    #[tokio::test]
    async fn slow_step_times_out_as_failed() {
        let mut registry = StepRegistry::new();
        registry.register(SlowStep {
            name: "slow".to_string(),
            delay: Duration::from_secs(30),
        });
        let config = EngineConfig {
            step_timeout_secs: Some(1),
            ..EngineConfig::default()
        };
        let runner = runner(registry, DeciderRegistry::new(), config);
        runner.register(JobDefinition::new(linear("job", &["slow"], vec![])));

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(report.exit.description.contains("timed out"));
    }

    #[tokio::test]
    async fn stop_takes_effect_at_next_node_boundary() {
        let journal = Journal::default();
        let gate = GateStep::new("first", &journal);
        let (entered, release) = (Arc::clone(&gate.entered), Arc::clone(&gate.release));
        let mut registry = steps(vec![
            ScriptedStep::completes("second", &journal),
            ScriptedStep::completes("third", &journal),
        ]);
        registry.register(gate);
        let runner = single(
            registry,
            linear("job", &["first", "second", "third"], vec![]),
        );
        let instance = runner.instance_id("job", &JobParameters::new());

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run("job", JobParameters::new()).await })
        };
        entered.notified().await;

        let snapshot = runner.current_state(&instance).await.unwrap().unwrap();
        assert_eq!(snapshot.state, FlowState::RunningNode);
        assert_eq!(snapshot.current_node.as_deref(), Some("first"));

        let err = runner.run("job", JobParameters::new()).await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyRunning(_)));

        assert!(runner.stop(&instance));
        let snapshot = runner.current_state(&instance).await.unwrap().unwrap();
        assert_eq!(snapshot.status, BatchStatus::Stopping);
        release.notify_one();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Stopped);
        assert_eq!(report.record.completed_nodes, vec!["first"]);
        assert_eq!(report.record.restart_node.as_deref(), Some("second"));
        assert!(!runner.stop(&instance));

        let resumed = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(journal.calls(), vec!["first", "second", "third"]);

        let snapshot = runner.current_state(&instance).await.unwrap().unwrap();
        assert_eq!(snapshot.state, FlowState::Terminated);
        assert_eq!(snapshot.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn stop_reaches_running_split_branches() {
        let journal = Journal::default();
        let gate = GateStep::new("hold", &journal);
        let (entered, release) = (Arc::clone(&gate.entered), Arc::clone(&gate.release));
        let mut registry = steps(vec![
            ScriptedStep::completes("after", &journal),
            ScriptedStep::completes("quick", &journal),
            ScriptedStep::completes("done", &journal),
        ]);
        registry.register(gate);

        let slow_branch = FlowGraph::builder("slow")
            .step("hold", "hold", vec![Transition::to("*", "after")])
            .step("after", "after", vec![])
            .build()
            .unwrap();
        let quick_branch = FlowGraph::builder("quick")
            .step("quick", "quick", vec![])
            .build()
            .unwrap();
        let graph = FlowGraph::builder("job")
            .split(
                "fan",
                vec![slow_branch, quick_branch],
                vec![Transition::to(ExitStatus::COMPLETED, "done"), Transition::fail("*")],
            )
            .step("done", "done", vec![])
            .build()
            .unwrap();
        let runner = single(registry, graph);
        let instance = runner.instance_id("job", &JobParameters::new());

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run("job", JobParameters::new()).await })
        };
        entered.notified().await;
        assert!(runner.stop(&instance));
        release.notify_one();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Stopped);
        assert_eq!(report.record.restart_node.as_deref(), Some("fan"));
        let branches = &report.record.branches["fan"];
        assert_eq!(branches[0].status, BatchStatus::Stopped);
        assert_eq!(branches[0].restart_node.as_deref(), Some("after"));
        assert_eq!(journal.count("after"), 0);

        let resumed = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(journal.count("hold"), 1);
        assert_eq!(journal.count("quick"), 1);
        assert_eq!(journal.count("after"), 1);
        assert_eq!(journal.count("done"), 1);
    }

    #[tokio::test]
    async fn abandoned_instance_cannot_restart() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![ScriptedStep::fails_once("a", &journal)]),
            linear("job", &["a"], vec![]),
        );
        let first = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);

        let marker = runner.abandon(&first.instance_id).await.unwrap();
        assert_eq!(marker.attempt, 2);
        assert_eq!(marker.status(), BatchStatus::Abandoned);

        let err = runner.run("job", JobParameters::new()).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Restart(RestartError::NotRestartable {
                status: BatchStatus::Abandoned,
                ..
            })
        ));
        assert_eq!(journal.count("a"), 1);

        let err = runner.abandon(&first.instance_id).await.unwrap_err();
        assert!(matches!(err, JobError::Restart(_)));
    }

    #[tokio::test]
    async fn abandon_seals_crashed_attempt_in_place() {
        let repo = InMemoryExecutionRepository::new();
        let params = JobParameters::new();
        let instance = JobInstanceId::derive("job", &params);
        let crashed = ExecutionRecord::start(
            instance.clone(),
            "job",
            1,
            params,
            Default::default(),
        );
        repo.append(&crashed).await.unwrap();

        let runner = JobRunner::builder(repo).build();
        let record = runner.abandon(&instance).await.unwrap();
        assert_eq!(record.execution_id, crashed.execution_id);
        assert_eq!(record.status(), BatchStatus::Abandoned);
        assert_eq!(runner.history(&instance).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandon_unknown_instance_is_an_error() {
        let runner = runner(StepRegistry::new(), DeciderRegistry::new(), EngineConfig::default());
        let err = runner
            .abandon(&JobInstanceId::from_raw("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NoExecution(_)));
    }

    #[tokio::test]
    async fn events_trace_the_attempt() {
        let journal = Journal::default();
        let runner = single(
            steps(vec![
                ScriptedStep::completes("a", &journal),
                ScriptedStep::completes("b", &journal),
            ]),
            linear("job", &["a", "b"], vec![]),
        );
        let mut events = runner.events();

        let report = runner.run("job", JobParameters::new()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.execution_id(), report.record.execution_id);
            kinds.push(match event {
                FlowEvent::JobStarted { .. } => "job_started".to_string(),
                FlowEvent::NodeStarted { node, .. } => format!("start:{node}"),
                FlowEvent::NodeFinished { node, .. } => format!("finish:{node}"),
                FlowEvent::JobFinished { .. } => "job_finished".to_string(),
            });
        }
        assert_eq!(
            kinds,
            vec![
                "job_started",
                "start:a",
                "finish:a",
                "start:b",
                "finish:b",
                "job_finished"
            ]
        );
    }

    #[tokio::test]
    async fn registered_jobs_are_listed_by_name() {
        let runner = runner(StepRegistry::new(), DeciderRegistry::new(), EngineConfig::default());
        runner.register(JobDefinition::new(linear("zeta", &["a"], vec![])));
        runner.register(JobDefinition::new(linear("alpha", &["a"], vec![])).with_description("first"));

        let names: Vec<String> = runner.jobs().iter().map(|j| j.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(runner.job("alpha").unwrap().description(), Some("first"));
        assert!(runner.job("missing").is_none());
    }

    #[tokio::test]
    async fn sub_job_is_not_cut_off_by_step_timeout() {
        let mut registry = StepRegistry::new();
        for name in ["copy", "verify"] {
            registry.register(SlowStep {
                name: name.to_string(),
                delay: Duration::from_millis(700),
            });
        }
        let config = EngineConfig {
            step_timeout_secs: Some(1),
            ..EngineConfig::default()
        };
        let runner = runner(registry, DeciderRegistry::new(), config);
        runner.register(JobDefinition::new(linear("child", &["copy", "verify"], vec![])));
        runner.register(JobDefinition::new(
            FlowGraph::builder("parent")
                .sub_job("nest", "child", vec![], vec![])
                .build()
                .unwrap(),
        ));

        let report = runner.run("parent", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);

        let child = runner.instance_id("child", &JobParameters::new());
        let history = runner.history(&child).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_sealed());
        assert_eq!(history[0].status(), BatchStatus::Completed);
        assert!(!runner.stop(&child));

        let err = runner.run("child", JobParameters::new()).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Restart(RestartError::NotRestartable { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_run_releases_its_claim() {
        let journal = Journal::default();
        let gate = GateStep::new("hold", &journal);
        let entered = Arc::clone(&gate.entered);
        let mut registry = StepRegistry::new();
        registry.register(gate);
        let runner = single(registry, linear("job", &["hold"], vec![]));
        let instance = runner.instance_id("job", &JobParameters::new());

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run("job", JobParameters::new()).await })
        };
        entered.notified().await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        // No longer running here, but the attempt was never sealed.
        assert!(!runner.stop(&instance));
        let snapshot = runner.current_state(&instance).await.unwrap().unwrap();
        assert_eq!(snapshot.state, FlowState::Pending);
        let err = runner.run("job", JobParameters::new()).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Restart(RestartError::AlreadyRunning { attempt: 1, .. })
        ));

        let abandoned = runner.abandon(&instance).await.unwrap();
        assert_eq!(abandoned.attempt, 1);
        assert_eq!(abandoned.status(), BatchStatus::Abandoned);
    }

    #[tokio::test]
    async fn stop_transition_inside_branch_routes_completed_split() {
        let journal = Journal::default();
        let registry = steps(vec![
            ScriptedStep::exits("pause", &journal, "PAUSE"),
            ScriptedStep::completes("quick", &journal),
            ScriptedStep::completes("done", &journal),
        ]);
        let paused = FlowGraph::builder("paused")
            .step(
                "pause",
                "pause",
                vec![Transition::stop("PAUSE", "pause"), Transition::end("*")],
            )
            .build()
            .unwrap();
        let quick = FlowGraph::builder("quick")
            .step("quick", "quick", vec![])
            .build()
            .unwrap();
        let graph = FlowGraph::builder("job")
            .split(
                "fan",
                vec![paused, quick],
                vec![
                    Transition::to(ExitStatus::COMPLETED, "done"),
                    Transition::fail(ExitStatus::FAILED),
                ],
            )
            .step("done", "done", vec![])
            .build()
            .unwrap();
        let runner = single(registry, graph);

        let report = runner.run("job", JobParameters::new()).await.unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report.record.failure.is_none());
        assert_eq!(journal.count("done"), 1);

        let branches = &report.record.branches["fan"];
        assert_eq!(branches[0].status, BatchStatus::Stopped);
        assert_eq!(branches[0].restart_node.as_deref(), Some("pause"));
        assert_eq!(branches[1].status, BatchStatus::Completed);
    }
}
