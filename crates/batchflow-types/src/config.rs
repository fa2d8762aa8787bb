//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the batchflow data
//! directory. All fields have defaults so an empty or missing file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the flow engine and the CLI around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running branches of one split (0 = unbounded).
    #[serde(default)]
    pub max_parallel_branches: usize,

    /// Per-node timeout in seconds. Steps, deciders and sub-jobs that run
    /// longer are treated as `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,

    /// Maximum node visits per flow traversal before the attempt is failed.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,

    /// Maximum nesting of sub-job launches.
    #[serde(default = "default_max_sub_job_depth")]
    pub max_sub_job_depth: u8,

    /// Capacity of the flow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// SQLite URL for the execution history. Defaults to a file in the data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_node_visits() -> u32 {
    10_000
}

fn default_max_sub_job_depth() -> u8 {
    5
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_branches: 0,
            step_timeout_secs: None,
            max_node_visits: default_max_node_visits(),
            max_sub_job_depth: default_max_sub_job_depth(),
            event_capacity: default_event_capacity(),
            database_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Export spans through the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
