//! Shared test doubles for engine tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchflow_types::config::EngineConfig;
use batchflow_types::status::ExitStatus;
use tokio::sync::Notify;

use crate::flow::decider::{Decider, DeciderRegistry};
use crate::flow::step::{Step, StepContext, StepRegistry, StepResult};
use crate::job::JobRunner;
use crate::repository::InMemoryExecutionRepository;

/// Ordered log of every unit invocation, shared by all doubles of a test.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Record a call and return how many times `name` has now been called.
    pub fn record(&self, name: &str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(name.to_string());
        calls.iter().filter(|c| c.as_str() == name).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

type Script = dyn Fn(usize, &StepContext) -> anyhow::Result<StepResult> + Send + Sync;

/// A step whose behaviour is a closure of (call number, context).
pub struct ScriptedStep {
    name: String,
    journal: Journal,
    script: Box<Script>,
}

impl ScriptedStep {
    pub fn new(
        name: &str,
        journal: &Journal,
        script: impl Fn(usize, &StepContext) -> anyhow::Result<StepResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            script: Box::new(script),
        }
    }

    pub fn completes(name: &str, journal: &Journal) -> Self {
        Self::new(name, journal, |_, _| Ok(StepResult::completed()))
    }

    pub fn exits(name: &str, journal: &Journal, code: &'static str) -> Self {
        Self::new(name, journal, move |_, _| {
            Ok(StepResult::completed().with_exit_code(code))
        })
    }

    /// Fails on the first call, completes afterwards.
    pub fn fails_once(name: &str, journal: &Journal) -> Self {
        Self::new(name, journal, |call, _| {
            if call == 1 {
                Ok(StepResult::failed("first attempt fails"))
            } else {
                Ok(StepResult::completed())
            }
        })
    }
}

impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResult> {
        let call = self.journal.record(&self.name);
        (self.script)(call, ctx)
    }
}

/// Blocks inside `execute` until released.
pub struct GateStep {
    name: String,
    journal: Journal,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GateStep {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

impl Step for GateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StepContext) -> anyhow::Result<StepResult> {
        self.journal.record(&self.name);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StepResult::completed())
    }
}

/// Sleeps before completing.
pub struct SlowStep {
    pub name: String,
    pub delay: Duration,
}

impl Step for SlowStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StepContext) -> anyhow::Result<StepResult> {
        tokio::time::sleep(self.delay).await;
        Ok(StepResult::completed())
    }
}

/// Routes on a context key, falling back to the previous node's exit code.
pub struct KeyDecider {
    pub name: String,
    pub key: String,
    pub journal: Journal,
}

impl Decider for KeyDecider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(&self, ctx: &StepContext) -> anyhow::Result<ExitStatus> {
        self.journal.record(&self.name);
        let code = ctx
            .context
            .get_string(&self.key)
            .or_else(|| ctx.last.as_ref().map(|l| format!("AFTER_{}", l.exit.code)))
            .unwrap_or_else(|| "NONE".to_string());
        Ok(ExitStatus::new(code))
    }
}

pub fn runner(
    steps: StepRegistry,
    deciders: DeciderRegistry,
    config: EngineConfig,
) -> JobRunner<InMemoryExecutionRepository> {
    JobRunner::builder(InMemoryExecutionRepository::new())
        .steps(steps)
        .deciders(deciders)
        .config(config)
        .build()
}

