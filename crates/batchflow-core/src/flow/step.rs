//! Units of work: the `Step` trait, its type-erased wrapper and registry.
//!
//! Steps are external collaborators. The engine only invokes them and
//! observes the `StepResult` they hand back; what a step does with records,
//! transactions or retries is its own business.
//!
//! `Step` uses native async fn in traits, so it cannot be a trait object.
//! `StepDyn` is the object-safe twin (boxed futures) with a blanket impl for
//! every `Step`, and `BoxStep` wraps it for storage in the registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use batchflow_types::execution::{ExecutionContext, NodeOutcome};
use batchflow_types::job::{JobInstanceId, JobParameters};
use batchflow_types::status::{BatchStatus, ExitStatus};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Context & result
// ---------------------------------------------------------------------------

/// Read-only view handed to steps and deciders.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_name: String,
    pub instance_id: JobInstanceId,
    pub execution_id: Uuid,
    pub attempt: u32,
    /// Graph the node belongs to (the job itself or a split branch).
    pub flow: String,
    pub node: String,
    pub parameters: JobParameters,
    pub context: ExecutionContext,
    /// Outcome of the node visited before this one, if any. On a restart
    /// this is the last outcome recorded by the previous attempt.
    pub last: Option<NodeOutcome>,
}

impl StepContext {
    /// Whether this invocation belongs to a restarted attempt.
    pub fn is_restart(&self) -> bool {
        self.attempt > 1
    }
}

/// What a step reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: BatchStatus,
    pub exit: ExitStatus,
    /// Merged into the job execution context once the node completes.
    pub context_updates: ExecutionContext,
}

impl StepResult {
    pub fn new(status: BatchStatus, exit: ExitStatus) -> Self {
        Self {
            status,
            exit,
            context_updates: ExecutionContext::new(),
        }
    }

    pub fn completed() -> Self {
        Self::new(BatchStatus::Completed, ExitStatus::completed())
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new(
            BatchStatus::Failed,
            ExitStatus::failed().with_description(description),
        )
    }

    pub fn stopped() -> Self {
        Self::new(BatchStatus::Stopped, ExitStatus::stopped())
    }

    /// Keep the status, route on a custom exit code.
    pub fn with_exit_code(mut self, code: impl Into<String>) -> Self {
        self.exit = self.exit.replace_code(code);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.exit = self.exit.with_description(description);
        self
    }

    pub fn with_update(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context_updates.insert(key, value);
        self
    }
}

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// A unit of work the engine can invoke.
///
/// Must be safe to invoke again for the same node after a failed attempt.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn execute(
        &self,
        ctx: &StepContext,
    ) -> impl Future<Output = anyhow::Result<StepResult>> + Send;
}

/// Object-safe version of [`Step`] with boxed futures.
pub trait StepDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StepResult>> + Send + 'a>>;
}

impl<T: Step> StepDyn for T {
    fn name(&self) -> &str {
        Step::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StepResult>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }
}

/// Type-erased step.
pub struct BoxStep {
    inner: Box<dyn StepDyn + Send + Sync>,
}

impl BoxStep {
    pub fn new<T: Step + 'static>(step: T) -> Self {
        Self {
            inner: Box::new(step),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResult> {
        self.inner.execute_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStep").field("name", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Steps by name. Graph nodes refer to steps through this registry.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<BoxStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its own name, replacing any previous entry.
    pub fn register<T: Step + 'static>(&mut self, step: T) {
        let step = BoxStep::new(step);
        self.steps.insert(step.name().to_string(), Arc::new(step));
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxStep>> {
        self.steps.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
