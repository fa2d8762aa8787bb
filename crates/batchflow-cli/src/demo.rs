//! Built-in demonstration jobs.
//!
//! `etl` extracts rows, routes on the row count, enriches in two parallel
//! branches, loads, then launches `archive` as a sub-job. Every step is a
//! `DemoStep` that sleeps briefly and completes unless the operator asked
//! for it to fail with `--fail-at`.

use std::sync::Arc;
use std::time::Duration;

use batchflow_core::flow::{
    Decider, DeciderRegistry, FlowGraph, GraphError, Step, StepContext, StepRegistry, StepResult,
    Transition,
};
use batchflow_core::job::JobDefinition;
use batchflow_types::status::ExitStatus;

/// Rows extracted when the `rows` parameter is absent.
const DEFAULT_ROWS: u64 = 1_000;

/// Operator-injected behaviour for one `bflow run` invocation.
#[derive(Debug, Clone, Default)]
pub struct DemoPlan {
    /// Step that returns `FAILED` instead of completing.
    pub fail_at: Option<String>,
    pub step_delay: Duration,
}

impl DemoPlan {
    pub fn new(fail_at: Option<String>) -> Self {
        Self {
            fail_at,
            step_delay: Duration::from_millis(150),
        }
    }
}

struct DemoStep {
    name: &'static str,
    plan: Arc<DemoPlan>,
}

impl Step for DemoStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResult> {
        tokio::time::sleep(self.plan.step_delay).await;

        if self.plan.fail_at.as_deref() == Some(self.name) {
            tracing::warn!(step = self.name, "injected failure");
            return Ok(StepResult::failed("failure injected by --fail-at"));
        }

        let mut result = StepResult::completed().with_update(format!("{}.attempt", self.name), ctx.attempt);
        if self.name == "extract" {
            let rows = match ctx.parameters.get("rows") {
                Some(raw) => raw.parse::<u64>()?,
                None => DEFAULT_ROWS,
            };
            result = result.with_update("rows", rows);
        }
        Ok(result)
    }
}

/// Routes `etl` on how many rows `extract` produced.
struct RowCountDecider;

impl Decider for RowCountDecider {
    fn name(&self) -> &str {
        "row_count"
    }

    async fn decide(&self, ctx: &StepContext) -> anyhow::Result<ExitStatus> {
        let rows = ctx.context.get("rows").and_then(|v| v.as_u64()).unwrap_or(0);
        let code = if rows == 0 { "EMPTY" } else { "HAS_ROWS" };
        Ok(ExitStatus::new(code).with_description(format!("{rows} rows")))
    }
}

pub fn steps(plan: &Arc<DemoPlan>) -> StepRegistry {
    let mut steps = StepRegistry::new();
    for name in ["extract", "geocode", "rates", "load", "compress", "upload"] {
        steps.register(DemoStep {
            name,
            plan: Arc::clone(plan),
        });
    }
    steps
}

pub fn deciders() -> DeciderRegistry {
    let mut deciders = DeciderRegistry::new();
    deciders.register(RowCountDecider);
    deciders
}

fn next(target: &str) -> Vec<Transition> {
    vec![Transition::fail("FAILED"), Transition::to("*", target)]
}

fn etl() -> Result<JobDefinition, GraphError> {
    let geo = FlowGraph::builder("geo")
        .step("geocode", "geocode", vec![])
        .build()?;
    let fx = FlowGraph::builder("fx").step("rates", "rates", vec![]).build()?;

    let graph = FlowGraph::builder("etl")
        .step("extract", "extract", next("check"))
        .decision(
            "check",
            "row_count",
            vec![
                Transition::end("EMPTY").with_exit_code("NOTHING_TO_LOAD"),
                Transition::to("*", "enrich"),
            ],
        )
        .split("enrich", vec![geo, fx], next("load"))
        .step("load", "load", next("archive"))
        .sub_job(
            "archive",
            "archive",
            vec!["date".to_string()],
            vec![Transition::fail("FAILED"), Transition::end("*")],
        )
        .build()?;

    Ok(JobDefinition::new(graph)
        .with_description("extract, enrich in parallel, load, then archive"))
}

fn archive() -> Result<JobDefinition, GraphError> {
    let graph = FlowGraph::builder("archive")
        .step("compress", "compress", next("upload"))
        .step("upload", "upload", vec![Transition::fail("FAILED"), Transition::end("*")])
        .build()?;
    Ok(JobDefinition::new(graph).with_description("compress and upload one day of output"))
}

pub fn jobs() -> Result<Vec<JobDefinition>, GraphError> {
    Ok(vec![etl()?, archive()?])
}
