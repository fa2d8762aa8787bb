//! `bflow abandon`: retire a job instance so it is never restarted.

use anyhow::Result;
use batchflow_types::job::JobParameters;
use console::style;
use dialoguer::Confirm;

use super::styled_status;
use crate::state::AppState;

pub async fn abandon_instance(
    state: &AppState,
    job: &str,
    parameters: JobParameters,
    force: bool,
    json: bool,
) -> Result<()> {
    let instance_id = state.runner.instance_id(job, &parameters);

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Abandon {} instance {}? It can never be restarted.",
                style(job).cyan(),
                style(instance_id.short()).red().bold()
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let record = state.runner.abandon(&instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} instance {} is now {} (attempt {})",
        style("*").green().bold(),
        style(job).cyan(),
        instance_id.short(),
        styled_status(record.status()),
        record.attempt
    );
    println!();

    Ok(())
}
