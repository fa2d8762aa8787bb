//! Application state wiring the engine to its SQLite history.

use std::path::PathBuf;
use std::sync::Arc;

use batchflow_core::job::JobRunner;
use batchflow_infra::config::resolve_database_url;
use batchflow_infra::sqlite::execution::SqliteExecutionRepository;
use batchflow_infra::sqlite::pool::DatabasePool;
use batchflow_types::config::EngineConfig;

use crate::demo::{self, DemoPlan};

pub type ConcreteJobRunner = JobRunner<SqliteExecutionRepository>;

/// Everything a command handler needs.
#[derive(Clone)]
pub struct AppState {
    pub runner: ConcreteJobRunner,
    pub data_dir: PathBuf,
    pub database_url: String,
}

impl AppState {
    /// Open the history database and register the demo jobs.
    pub async fn init(data_dir: PathBuf, config: EngineConfig, plan: DemoPlan) -> anyhow::Result<Self> {
        let database_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&database_url).await?;

        let plan = Arc::new(plan);
        let runner = JobRunner::builder(SqliteExecutionRepository::new(db_pool))
            .steps(demo::steps(&plan))
            .deciders(demo::deciders())
            .config(config)
            .build();
        for job in demo::jobs()? {
            runner.register(job);
        }

        Ok(Self {
            runner,
            data_dir,
            database_url,
        })
    }
}
