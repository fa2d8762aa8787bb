//! `bflow history`: every attempt of one job instance.

use anyhow::Result;
use batchflow_types::execution::ExecutionRecord;
use batchflow_types::job::JobParameters;
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;

use super::{format_duration, hint, status_color};
use crate::state::AppState;

pub async fn show_history(state: &AppState, job: &str, parameters: JobParameters, json: bool) -> Result<()> {
    let instance_id = state.runner.instance_id(job, &parameters);
    let records = state.runner.history(&instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No attempts recorded for {} ({}).", style(job).cyan(), instance_id.short());
        hint(&format!("Start one with: bflow run {job}"));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Attempt").fg(comfy_table::Color::Cyan),
            Cell::new("Status"),
            Cell::new("Exit"),
            Cell::new("Nodes"),
            Cell::new("Restart At"),
            Cell::new("Started"),
            Cell::new("Took"),
        ]);

    for record in &records {
        table.add_row(vec![
            Cell::new(record.attempt),
            Cell::new(record.status()).fg(status_color(record.status())),
            Cell::new(record.final_exit.as_ref().map(|e| e.code.as_str()).unwrap_or("-")),
            Cell::new(record.completed_nodes.join(" > ")),
            Cell::new(record.restart_node.as_deref().unwrap_or("-")),
            Cell::new(record.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(took(record)),
        ]);
    }

    println!();
    println!("  {} instance {}", style(job).cyan().bold(), instance_id);
    println!("{table}");
    if let Some(failure) = records.last().and_then(|r| r.failure.as_ref()) {
        println!("  Last failure: {}", style(failure).red());
    }
    println!();

    Ok(())
}

fn took(record: &ExecutionRecord) -> String {
    match record.ended_at {
        Some(ended) => format_duration((ended - record.started_at).num_milliseconds()),
        None => "running".to_string(),
    }
}
