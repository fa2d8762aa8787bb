//! In-process execution history, keyed by job instance.
//!
//! Not durable. Used for tests and for callers that only need restart
//! semantics within a single process.

use std::sync::Arc;

use batchflow_types::error::RepositoryError;
use batchflow_types::execution::ExecutionRecord;
use batchflow_types::job::JobInstanceId;
use dashmap::DashMap;

use super::execution::ExecutionRepository;

/// Cloning shares the underlying store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionRepository {
    records: Arc<DashMap<JobInstanceId, Vec<ExecutionRecord>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut attempts = self.records.entry(record.instance_id.clone()).or_default();
        match attempts
            .iter_mut()
            .find(|r| r.execution_id == record.execution_id)
        {
            Some(existing) => *existing = record.clone(),
            None => {
                if attempts.iter().any(|r| r.attempt == record.attempt) {
                    return Err(RepositoryError::Conflict(format!(
                        "attempt {} already recorded for instance {}",
                        record.attempt,
                        record.instance_id.short()
                    )));
                }
                attempts.push(record.clone());
                attempts.sort_by_key(|r| r.attempt);
            }
        }
        Ok(())
    }

    async fn load_latest(
        &self,
        instance_id: &JobInstanceId,
    ) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .and_then(|attempts| attempts.last().cloned()))
    }

    async fn list(&self, instance_id: &JobInstanceId) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        Ok(self
            .records
            .get(instance_id)
            .map(|attempts| attempts.clone())
            .unwrap_or_default())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut all: Vec<ExecutionRecord> = self
            .records
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit as usize);
        Ok(all)
    }
}
