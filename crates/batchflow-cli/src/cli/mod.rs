//! CLI command definitions for the `bflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod abandon;
pub mod history;
pub mod jobs;
pub mod run;
pub mod status;

use batchflow_types::job::JobParameters;
use batchflow_types::status::BatchStatus;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::{Style, style};

/// Run and inspect restartable batch jobs.
#[derive(Parser)]
#[command(name = "bflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a job instance, restarting it if its last attempt failed or stopped.
    Run {
        /// Job name (see `bflow jobs`).
        job: String,

        #[command(flatten)]
        params: ParamArgs,

        /// Non-identifying parameter (key=value); does not change the instance.
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = JobParameters::parse_pair)]
        options: Vec<(String, String)>,

        /// Make the named step fail on this run.
        #[arg(long, value_name = "STEP")]
        fail_at: Option<String>,

        /// Request a stop while the named node is running.
        #[arg(long, value_name = "NODE")]
        stop_at: Option<String>,
    },

    /// Show every attempt of a job instance.
    History {
        job: String,

        #[command(flatten)]
        params: ParamArgs,
    },

    /// List registered jobs and their flow graphs.
    Jobs,

    /// Mark a failed or stopped job instance as never to be restarted.
    Abandon {
        job: String,

        #[command(flatten)]
        params: ParamArgs,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Recent attempts across all jobs.
    Status {
        /// Maximum number of attempts to display.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Identifying job parameters.
#[derive(Args, Clone, Default)]
pub struct ParamArgs {
    /// Identifying parameter (key=value); repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = JobParameters::parse_pair)]
    pub params: Vec<(String, String)>,
}

impl ParamArgs {
    pub fn to_parameters(&self) -> JobParameters {
        let mut parameters = JobParameters::new();
        for (key, value) in &self.params {
            parameters.insert(key.clone(), value.clone(), true);
        }
        parameters
    }
}

/// Console style for a status label.
pub fn status_style(status: BatchStatus) -> Style {
    match status {
        BatchStatus::Completed => Style::new().green(),
        BatchStatus::Failed | BatchStatus::Unknown => Style::new().red(),
        BatchStatus::Stopped | BatchStatus::Stopping => Style::new().yellow(),
        BatchStatus::Abandoned => Style::new().dim(),
        BatchStatus::Starting | BatchStatus::Started => Style::new().cyan(),
    }
}

/// Colored status text for tables.
pub fn status_color(status: BatchStatus) -> comfy_table::Color {
    match status {
        BatchStatus::Completed => comfy_table::Color::Green,
        BatchStatus::Failed | BatchStatus::Unknown => comfy_table::Color::Red,
        BatchStatus::Stopped | BatchStatus::Stopping => comfy_table::Color::Yellow,
        BatchStatus::Abandoned => comfy_table::Color::DarkGrey,
        BatchStatus::Starting | BatchStatus::Started => comfy_table::Color::Cyan,
    }
}

pub fn styled_status(status: BatchStatus) -> String {
    format!("{}", status_style(status).apply_to(status.as_str()))
}

/// `12ms`, `3.4s` or `2m05s`.
pub fn format_duration(ms: i64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

pub fn hint(text: &str) {
    println!("  {}", style(text).dim());
}
