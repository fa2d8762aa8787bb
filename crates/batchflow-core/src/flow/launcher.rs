//! Sub-job launching boundary.
//!
//! A `SubJob` node hands a parameter set to a `JobLauncher` and blocks until
//! the nested job instance reaches a terminal status. The nested status and
//! exit signal become the node's own outcome, so a failed child is just
//! another exit code for the parent's transitions.

use std::future::Future;
use std::pin::Pin;

use batchflow_types::execution::ExecutionContext;
use batchflow_types::job::{JobInstanceId, JobParameters};
use batchflow_types::status::{BatchStatus, ExitStatus};

/// Terminal result of a launched job.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOutcome {
    pub instance_id: JobInstanceId,
    pub status: BatchStatus,
    pub exit: ExitStatus,
}

/// Launches an independently tracked job and waits for it.
pub trait JobLauncher: Send + Sync {
    /// `depth` is the nesting level of the launched job (1 for a direct child).
    fn launch(
        &self,
        job: &str,
        parameters: JobParameters,
        depth: u8,
    ) -> impl Future<Output = anyhow::Result<LaunchOutcome>> + Send;
}

/// Object-safe version of [`JobLauncher`] with boxed futures.
pub trait JobLauncherDyn: Send + Sync {
    fn launch_boxed<'a>(
        &'a self,
        job: &'a str,
        parameters: JobParameters,
        depth: u8,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LaunchOutcome>> + Send + 'a>>;
}

impl<T: JobLauncher> JobLauncherDyn for T {
    fn launch_boxed<'a>(
        &'a self,
        job: &'a str,
        parameters: JobParameters,
        depth: u8,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LaunchOutcome>> + Send + 'a>> {
        Box::pin(self.launch(job, parameters, depth))
    }
}

/// Type-erased job launcher.
pub struct BoxJobLauncher {
    inner: Box<dyn JobLauncherDyn + Send + Sync>,
}

impl BoxJobLauncher {
    pub fn new<T: JobLauncher + 'static>(launcher: T) -> Self {
        Self {
            inner: Box::new(launcher),
        }
    }

    pub async fn launch(
        &self,
        job: &str,
        parameters: JobParameters,
        depth: u8,
    ) -> anyhow::Result<LaunchOutcome> {
        self.inner.launch_boxed(job, parameters, depth).await
    }
}

// ---------------------------------------------------------------------------
// Parameter extraction
// ---------------------------------------------------------------------------

/// Derives the nested job's parameters from the parent's state.
pub trait ParameterExtractor: Send + Sync {
    fn extract(
        &self,
        context: &ExecutionContext,
        parent: &JobParameters,
        keys: &[String],
    ) -> JobParameters;
}

/// For each declared key, take the execution context value, falling back to
/// the parent job parameter of the same name. Keys found in neither are
/// skipped. Extracted parameters are identifying.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextParameterExtractor;

impl ParameterExtractor for ContextParameterExtractor {
    fn extract(
        &self,
        context: &ExecutionContext,
        parent: &JobParameters,
        keys: &[String],
    ) -> JobParameters {
        let mut params = JobParameters::new();
        for key in keys {
            if let Some(value) = context.get_string(key) {
                params.insert(key.clone(), value, true);
            } else if let Some(value) = parent.get(key) {
                params.insert(key.clone(), value, true);
            }
        }
        params
    }
}
