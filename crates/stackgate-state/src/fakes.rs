//! In-memory fakes for the store traits.
//!
//! Provides `MemoryJobStore`, `MemoryRunStore`, and `MemoryPlanStorage`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::*;
use crate::store::*;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

/// In-memory batch and job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    batches: Mutex<HashMap<BatchId, BatchRecord>>,
    jobs: Mutex<Vec<JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_batch(&self, batch: BatchRecord) -> StorageResult<()> {
        guard(&self.batches).insert(batch.batch_id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &BatchId) -> StorageResult<BatchRecord> {
        guard(&self.batches)
            .get(batch_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("batch", batch_id.as_str()))
    }

    async fn set_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
    ) -> StorageResult<()> {
        let mut batches = guard(&self.batches);
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| StorageError::not_found("batch", batch_id.as_str()))?;
        batch.status = status;
        Ok(())
    }

    async fn create_job(&self, job: JobRecord) -> StorageResult<()> {
        guard(&self.jobs).push(job);
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        guard(&self.jobs)
            .iter()
            .find(|j| &j.job_id == job_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("job", job_id.as_str()))
    }

    async fn jobs_for_batch(&self, batch_id: &BatchId) -> StorageResult<Vec<JobRecord>> {
        Ok(guard(&self.jobs)
            .iter()
            .filter(|j| &j.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn set_job_status(&self, job_id: &JobId, status: JobStatus) -> StorageResult<()> {
        let mut jobs = guard(&self.jobs);
        let job = jobs
            .iter_mut()
            .find(|j| &j.job_id == job_id)
            .ok_or_else(|| StorageError::not_found("job", job_id.as_str()))?;
        job.status = status;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

/// In-memory run store. The compare-and-set runs under one mutex, so two
/// racing writers can never both win.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, ProjectRun>>,
    queue: Mutex<Vec<RunQueueItem>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: ProjectRun) -> StorageResult<()> {
        guard(&self.runs).insert(run.run_id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<ProjectRun> {
        guard(&self.runs)
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("run", run_id.as_str()))
    }

    async fn compare_and_set_status(
        &self,
        run_id: &RunId,
        expected_version: u64,
        status: RunStatus,
    ) -> StorageResult<ProjectRun> {
        let mut runs = guard(&self.runs);
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::not_found("run", run_id.as_str()))?;
        if run.version != expected_version {
            return Err(StorageError::VersionConflict {
                run_id: run_id.to_string(),
                expected: expected_version,
                actual: run.version,
            });
        }
        run.status = status;
        run.version += 1;
        Ok(run.clone())
    }

    async fn enqueue(&self, run: &ProjectRun) -> StorageResult<RunQueueItem> {
        let item = RunQueueItem::for_run(run);
        guard(&self.queue).push(item.clone());
        Ok(item)
    }

    async fn queue_items(&self) -> StorageResult<Vec<RunQueueItem>> {
        let mut items = guard(&self.queue).clone();
        // Stable: equal timestamps keep insertion order.
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    async fn dequeue(&self, item_id: &QueueItemId) -> StorageResult<()> {
        guard(&self.queue).retain(|i| &i.id != item_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPlanStorage
// ---------------------------------------------------------------------------

/// In-memory plan artifact storage keyed by path.
#[derive(Debug, Default)]
pub struct MemoryPlanStorage {
    plans: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryPlanStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        guard(&self.plans).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PlanStorage for MemoryPlanStorage {
    async fn store_plan(&self, path: &str, plan: &[u8]) -> StorageResult<()> {
        guard(&self.plans).insert(path.to_string(), plan.to_vec());
        Ok(())
    }

    async fn retrieve_plan(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(guard(&self.plans).get(path).cloned())
    }

    async fn delete_stored_plan(&self, path: &str) -> StorageResult<()> {
        guard(&self.plans).remove(path);
        Ok(())
    }

    async fn plan_exists(&self, path: &str) -> StorageResult<bool> {
        Ok(guard(&self.plans).contains_key(path))
    }
}
