//! SQLite execution history repository.
//!
//! Implements `ExecutionRepository` from `batchflow-core`. One row per
//! attempt; structured fields (parameters, exits, branch outcomes, context)
//! are stored as JSON text.

use std::collections::BTreeMap;
use std::str::FromStr;

use batchflow_core::repository::ExecutionRepository;
use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{ExecutionContext, ExecutionRecord, FlowFailure, FlowOutcome};
use batchflow_types::job::{JobInstanceId, JobParameters};
use batchflow_types::status::{BatchStatus, ExitStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
#[derive(Clone)]
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    execution_id: String,
    instance_id: String,
    job_name: String,
    attempt: i64,
    parameters: String,
    completed_nodes: String,
    last_node: Option<String>,
    last_exit: Option<String>,
    final_status: Option<String>,
    final_exit: Option<String>,
    restart_node: Option<String>,
    failure: Option<String>,
    branches: String,
    context: String,
    started_at: String,
    ended_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            attempt: row.try_get("attempt")?,
            parameters: row.try_get("parameters")?,
            completed_nodes: row.try_get("completed_nodes")?,
            last_node: row.try_get("last_node")?,
            last_exit: row.try_get("last_exit")?,
            final_status: row.try_get("final_status")?,
            final_exit: row.try_get("final_exit")?,
            restart_node: row.try_get("restart_node")?,
            failure: row.try_get("failure")?,
            branches: row.try_get("branches")?,
            context: row.try_get("context")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        let final_status = self
            .final_status
            .as_deref()
            .map(|s| {
                BatchStatus::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid final_status: {e}")))
            })
            .transpose()?;

        let parameters: JobParameters = from_json("parameters", &self.parameters)?;
        let completed_nodes: Vec<String> = from_json("completed_nodes", &self.completed_nodes)?;
        let branches: BTreeMap<String, Vec<FlowOutcome>> = from_json("branches", &self.branches)?;
        let context: ExecutionContext = from_json("context", &self.context)?;
        let last_exit: Option<ExitStatus> = opt_from_json("last_exit", self.last_exit.as_deref())?;
        let final_exit: Option<ExitStatus> = opt_from_json("final_exit", self.final_exit.as_deref())?;
        let failure: Option<FlowFailure> = opt_from_json("failure", self.failure.as_deref())?;

        Ok(ExecutionRecord {
            execution_id: parse_uuid(&self.execution_id)?,
            instance_id: JobInstanceId::from_raw(self.instance_id),
            job_name: self.job_name,
            attempt: u32::try_from(self.attempt)
                .map_err(|_| RepositoryError::Query(format!("invalid attempt: {}", self.attempt)))?,
            parameters,
            completed_nodes,
            last_node: self.last_node,
            last_exit,
            final_status,
            final_exit,
            restart_node: self.restart_node,
            failure,
            branches,
            context,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {column}: {e}")))
}

fn opt_to_json<T: Serialize>(column: &str, value: Option<&T>) -> Result<Option<String>, RepositoryError> {
    value.map(|v| to_json(column, v)).transpose()
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn opt_from_json<T: DeserializeOwned>(column: &str, raw: Option<&str>) -> Result<Option<T>, RepositoryError> {
    raw.map(|r| from_json(column, r)).transpose()
}

fn map_write_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn rows_into_records(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ExecutionRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let parameters = to_json("parameters", &record.parameters)?;
        let completed_nodes = to_json("completed_nodes", &record.completed_nodes)?;
        let last_exit = opt_to_json("last_exit", record.last_exit.as_ref())?;
        let final_exit = opt_to_json("final_exit", record.final_exit.as_ref())?;
        let failure = opt_to_json("failure", record.failure.as_ref())?;
        let branches = to_json("branches", &record.branches)?;
        let context = to_json("context", &record.context)?;

        sqlx::query(
            r#"INSERT INTO execution_records
               (execution_id, instance_id, job_name, attempt, parameters, completed_nodes,
                last_node, last_exit, final_status, final_exit, restart_node, failure,
                branches, context, started_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id) DO UPDATE SET
                 completed_nodes = excluded.completed_nodes,
                 last_node = excluded.last_node,
                 last_exit = excluded.last_exit,
                 final_status = excluded.final_status,
                 final_exit = excluded.final_exit,
                 restart_node = excluded.restart_node,
                 failure = excluded.failure,
                 branches = excluded.branches,
                 context = excluded.context,
                 ended_at = excluded.ended_at"#,
        )
        .bind(record.execution_id.to_string())
        .bind(record.instance_id.as_str())
        .bind(&record.job_name)
        .bind(i64::from(record.attempt))
        .bind(&parameters)
        .bind(&completed_nodes)
        .bind(&record.last_node)
        .bind(&last_exit)
        .bind(record.final_status.map(|s| s.as_str()))
        .bind(&final_exit)
        .bind(&record.restart_node)
        .bind(&failure)
        .bind(&branches)
        .bind(&context)
        .bind(format_datetime(&record.started_at))
        .bind(record.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn load_latest(
        &self,
        instance_id: &JobInstanceId,
    ) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM execution_records WHERE instance_id = ? ORDER BY attempt DESC LIMIT 1",
        )
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, instance_id: &JobInstanceId) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records WHERE instance_id = ? ORDER BY attempt ASC",
        )
        .bind(instance_id.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_into_records(&rows)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records ORDER BY started_at DESC, attempt DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_into_records(&rows)
    }
}
