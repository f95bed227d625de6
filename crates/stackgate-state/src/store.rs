//! Store traits consumed by the orchestration core.
//!
//! - `JobStore`: batches and their jobs
//! - `RunStore`: project runs and the per-project run queue
//! - `PlanStorage`: saved plan artifacts keyed by path
//!
//! All traits are async and backend-agnostic. In-memory fakes live in
//! [`crate::fakes`]; a SurrealDB implementation lives in
//! [`crate::surreal_store`].

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::{
    BatchId, BatchRecord, BatchStatus, JobId, JobRecord, JobStatus, ProjectRun, QueueItemId,
    RunId, RunQueueItem, RunStatus,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Batch and job persistence.
///
/// Guarantees:
/// - `jobs_for_batch` returns jobs in creation order.
/// - Status updates on unknown ids return `StorageError::NotFound`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_batch(&self, batch: BatchRecord) -> StorageResult<()>;

    async fn get_batch(&self, batch_id: &BatchId) -> StorageResult<BatchRecord>;

    async fn set_batch_status(&self, batch_id: &BatchId, status: BatchStatus)
        -> StorageResult<()>;

    async fn create_job(&self, job: JobRecord) -> StorageResult<()>;

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord>;

    async fn jobs_for_batch(&self, batch_id: &BatchId) -> StorageResult<Vec<JobRecord>>;

    async fn set_job_status(&self, job_id: &JobId, status: JobStatus) -> StorageResult<()>;
}

/// Project run persistence with a single-writer status claim.
///
/// Guarantees:
/// - `compare_and_set_status` succeeds only when the stored version equals
///   `expected_version`; it then writes `status` and bumps the version by one.
/// - Losing writers get `StorageError::VersionConflict` and nothing changes.
/// - `queue_items` returns items ordered by `created_at` ascending.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: ProjectRun) -> StorageResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<ProjectRun>;

    /// Write `status` if the run is still at `expected_version`.
    /// Returns the updated run.
    async fn compare_and_set_status(
        &self,
        run_id: &RunId,
        expected_version: u64,
        status: RunStatus,
    ) -> StorageResult<ProjectRun>;

    /// Add a ticket for `run` to the back of its project's queue.
    async fn enqueue(&self, run: &ProjectRun) -> StorageResult<RunQueueItem>;

    async fn queue_items(&self) -> StorageResult<Vec<RunQueueItem>>;

    /// Remove a ticket. No-op if already absent.
    async fn dequeue(&self, item_id: &QueueItemId) -> StorageResult<()>;
}

/// Saved plan artifacts.
///
/// Guarantees:
/// - `retrieve_plan` returns `None` for a path never stored or deleted.
/// - `delete_stored_plan` on a missing path is not an error.
#[async_trait]
pub trait PlanStorage: Send + Sync {
    async fn store_plan(&self, path: &str, plan: &[u8]) -> StorageResult<()>;

    async fn retrieve_plan(&self, path: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn delete_stored_plan(&self, path: &str) -> StorageResult<()>;

    async fn plan_exists(&self, path: &str) -> StorageResult<bool>;
}
