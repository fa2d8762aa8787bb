//! batchflow operator CLI.
//!
//! Binary name: `bflow`
//!
//! Parses CLI arguments, loads configuration, opens the execution history
//! and dispatches to the command handler.

mod cli;
mod demo;
mod state;

use clap::Parser;
use clap_complete::generate;

use batchflow_infra::config::load_engine_config;
use batchflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use cli::{Cli, Commands};
use demo::DemoPlan;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "bflow", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = resolve_data_dir();
    ensure_data_dir(&data_dir).await?;
    let config = load_engine_config(&data_dir).await;

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,batchflow_core=debug,batchflow_infra=debug",
        _ => "trace",
    };
    batchflow_observe::init_tracing(config.logging.format, config.logging.otel, filter)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let plan = match &cli.command {
        Commands::Run { fail_at, .. } => DemoPlan::new(fail_at.clone()),
        _ => DemoPlan::default(),
    };
    let state = AppState::init(data_dir, config, plan).await?;

    let outcome = dispatch(cli, &state).await;
    batchflow_observe::shutdown_tracing();

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the selected command. `Ok(false)` means the job did not complete.
async fn dispatch(cli: Cli, state: &AppState) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run {
            job,
            params,
            options,
            fail_at: _,
            stop_at,
        } => {
            let mut parameters = params.to_parameters();
            for (key, value) in options {
                parameters.insert(key, value, false);
            }
            cli::run::run_job(state, &job, parameters, stop_at, cli.json, cli.quiet).await
        }

        Commands::History { job, params } => {
            cli::history::show_history(state, &job, params.to_parameters(), cli.json).await?;
            Ok(true)
        }

        Commands::Jobs => {
            cli::jobs::list_jobs(state, cli.json)?;
            Ok(true)
        }

        Commands::Abandon { job, params, force } => {
            cli::abandon::abandon_instance(state, &job, params.to_parameters(), force, cli.json).await?;
            Ok(true)
        }

        Commands::Status { limit } => {
            cli::status::status(state, limit, cli.json).await?;
            Ok(true)
        }

        Commands::Completions { .. } => Ok(true),
    }
}
