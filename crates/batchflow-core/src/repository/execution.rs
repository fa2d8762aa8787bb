//! Execution history repository trait.
//!
//! The history store is durable and authoritative: restart decisions are
//! made from what `load_latest` returns and nothing else.

use batchflow_types::error::RepositoryError;
use batchflow_types::execution::ExecutionRecord;
use batchflow_types::job::JobInstanceId;

/// Storage for execution records.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    /// Insert or replace a record, keyed by `execution_id`.
    ///
    /// Called when an attempt opens, after every node and once at sealing.
    fn append(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The record with the highest attempt number for an instance.
    fn load_latest(
        &self,
        instance_id: &JobInstanceId,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// Every attempt of an instance, oldest first.
    fn list(
        &self,
        instance_id: &JobInstanceId,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    /// Most recently started attempts across all instances, newest first.
    fn list_recent(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;
}
