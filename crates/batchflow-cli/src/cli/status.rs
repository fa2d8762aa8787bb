//! System status dashboard command.

use std::collections::BTreeMap;

use anyhow::Result;
use batchflow_types::status::BatchStatus;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::status_color;
use crate::state::AppState;

/// Recent attempts across every job, with counts by status.
pub async fn status(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let recent = state.runner.recent(limit).await?;

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in &recent {
        *counts.entry(record.status().as_str()).or_default() += 1;
    }

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "database": state.database_url,
            "jobs": state.runner.jobs().iter().map(|j| j.name().to_string()).collect::<Vec<_>>(),
            "counts": counts,
            "recent": recent,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} batchflow v{}",
        style("*").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("── Recent attempts ──").dim());
    if recent.is_empty() {
        println!("  None yet.");
    } else {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Job").fg(Color::Cyan),
                Cell::new("Instance"),
                Cell::new("Attempt"),
                Cell::new("Status"),
                Cell::new("Last Node"),
                Cell::new("Started"),
            ]);
        for record in &recent {
            table.add_row(vec![
                Cell::new(&record.job_name),
                Cell::new(record.instance_id.short()),
                Cell::new(record.attempt),
                Cell::new(record.status()).fg(status_color(record.status())),
                Cell::new(record.last_node.as_deref().unwrap_or("-")),
                Cell::new(record.started_at.format("%Y-%m-%d %H:%M:%S")),
            ]);
        }
        println!("{table}");
        for status in BatchStatus::ALL {
            if let Some(n) = counts.get(status.as_str()) {
                println!("  {:<10} {n}", status.as_str());
            }
        }
    }
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!("  Database: {}", style(&state.database_url).dim());
    println!();

    Ok(())
}
