//! `bflow run`: execute or restart a job instance with live progress.

use std::time::Duration;

use anyhow::Result;
use batchflow_types::event::FlowEvent;
use batchflow_types::job::{JobInstanceId, JobParameters};
use console::style;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{format_duration, hint, styled_status};
use crate::state::{AppState, ConcreteJobRunner};

/// Run `job` and print its report. Returns whether the attempt completed.
pub async fn run_job(
    state: &AppState,
    job: &str,
    parameters: JobParameters,
    stop_at: Option<String>,
    json: bool,
    quiet: bool,
) -> Result<bool> {
    let runner = &state.runner;
    let instance_id = runner.instance_id(job, &parameters);

    let mut watcher = tokio::spawn(watch_events(
        runner.events(),
        runner.clone(),
        instance_id.clone(),
        stop_at,
        !(json || quiet),
    ));

    let result = runner.run(job, parameters).await;
    if result.is_ok() {
        // JobFinished is published before `run` returns.
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut watcher).await;
    }
    watcher.abort();
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.is_success());
    }
    if quiet {
        return Ok(report.is_success());
    }

    println!();
    println!(
        "  {} {} attempt {} finished {}",
        style("*").bold(),
        style(job).cyan(),
        report.attempt(),
        styled_status(report.status)
    );
    println!("  Instance:  {}", report.instance_id);
    println!("  Exit code: {}", report.exit.code);
    if !report.exit.description.is_empty() {
        println!("  Detail:    {}", report.exit.description);
    }
    if let Some(failure) = &report.record.failure {
        println!("  Failure:   {}", style(failure).red());
    }
    if let Some(node) = &report.record.restart_node {
        println!();
        println!("  Next run restarts at '{}'.", style(node).yellow());
        hint(&format!("Abandon instead: bflow abandon {job} {}", param_flags(&report.record.parameters)));
    }
    println!();

    Ok(report.is_success())
}

/// Print node progress and honor `--stop-at` until the instance finishes.
async fn watch_events(
    mut events: broadcast::Receiver<FlowEvent>,
    runner: ConcreteJobRunner,
    instance_id: JobInstanceId,
    stop_at: Option<String>,
    print: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress output lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            FlowEvent::JobStarted {
                job_name,
                attempt,
                start_node,
                ..
            } if print => {
                let verb = if *attempt > 1 { "Restarting" } else { "Starting" };
                println!(
                    "  {} {} (attempt {attempt}) at '{start_node}'",
                    style(verb).bold(),
                    style(job_name).cyan()
                );
            }
            FlowEvent::NodeStarted { node, .. } => {
                if stop_at.as_deref() == Some(node.as_str()) && runner.stop(&instance_id) && print {
                    println!("  {} stop requested during '{node}'", style("!").yellow().bold());
                }
            }
            FlowEvent::NodeFinished {
                flow,
                node,
                status,
                exit,
                duration_ms,
                ..
            } if print => {
                println!(
                    "    {:<24} {:<10} {} {}",
                    format!("{flow}/{node}"),
                    styled_status(*status),
                    exit.code,
                    style(format_duration(i64::try_from(*duration_ms).unwrap_or(i64::MAX))).dim()
                );
            }
            FlowEvent::JobFinished {
                instance_id: finished,
                ..
            } if *finished == instance_id => break,
            _ => {}
        }
    }
}

fn param_flags(parameters: &JobParameters) -> String {
    parameters
        .identifying()
        .map(|(key, p)| format!("--param {key}={}", p.value))
        .collect::<Vec<_>>()
        .join(" ")
}
