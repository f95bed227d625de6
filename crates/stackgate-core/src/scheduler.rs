//! Concurrency-limited dispatch of batch jobs to CI runners.
//!
//! Scheduling is a single pass: a job that does not fit under the cap is
//! parked as `QueuedForRun` and picked up by [`Scheduler::schedule_queued_jobs`]
//! when the caller re-invokes it, usually after another job finishes.

use std::sync::Arc;

use async_trait::async_trait;
use stackgate_state::{
    BatchId, BatchRecord, BatchStatus, BatchType, JobId, JobRecord, JobStatus, JobStore,
};
use tracing::{debug, info, warn};

use crate::error::GateResult;
use crate::jobs::{Job, JobSpec};

/// Starts a CI workflow run for one job.
#[async_trait]
pub trait CiTrigger: Send + Sync {
    async fn trigger_workflow(&self, spec: &JobSpec, vcs_token: &str) -> GateResult<()>;
}

/// Batch status implied by member job statuses.
///
/// Terminal batches never change. Any failed job fails the batch; all
/// succeeded jobs succeed it; a `Created` batch becomes `Started` once any
/// job is in flight.
pub fn derive_batch_status(current: BatchStatus, jobs: &[JobStatus]) -> BatchStatus {
    if current.is_terminal() {
        return current;
    }
    if jobs.iter().any(|s| *s == JobStatus::Failed) {
        return BatchStatus::Failed;
    }
    if !jobs.is_empty() && jobs.iter().all(|s| *s == JobStatus::Succeeded) {
        return BatchStatus::Succeeded;
    }
    if current == BatchStatus::Created && jobs.iter().any(|s| s.is_in_flight() || s.is_terminal()) {
        return BatchStatus::Started;
    }
    current
}

/// Dispatches jobs of a batch, at most `max_concurrency` at a time.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    trigger: Arc<dyn CiTrigger>,
    /// 0 means unlimited.
    max_concurrency: u32,
    vcs_token: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        trigger: Arc<dyn CiTrigger>,
        max_concurrency: u32,
        vcs_token: impl Into<String>,
    ) -> Self {
        Self {
            store,
            trigger,
            max_concurrency,
            vcs_token: vcs_token.into(),
        }
    }

    /// Persist a batch and one `Created` job record per job.
    pub async fn create_batch(
        &self,
        batch_type: BatchType,
        namespace: &str,
        pr_number: Option<u64>,
        branch: Option<String>,
        jobs: &[Job],
    ) -> GateResult<(BatchRecord, Vec<JobRecord>)> {
        let mut batch = BatchRecord::new(batch_type, namespace);
        batch.pr_number = pr_number;
        batch.branch = branch;
        self.store.create_batch(batch.clone()).await?;

        let mut records = Vec::with_capacity(jobs.len());
        for job in jobs {
            let run_name = format!("[{}] {} {}", namespace, job.job_type, job.project_name);
            let spec = job.to_spec(run_name.clone()).to_value()?;
            let record = JobRecord::new(batch.batch_id.clone(), &job.project_name, spec, run_name);
            self.store.create_job(record.clone()).await?;
            records.push(record);
        }
        info!(batch = %batch.batch_id, jobs = records.len(), "batch created");
        Ok((batch, records))
    }

    /// Dispatch `job_id` if its batch has a free slot, otherwise park it.
    /// Returns the job's new status.
    pub async fn schedule_job(&self, job_id: &JobId) -> GateResult<JobStatus> {
        let job = self.store.get_job(job_id).await?;
        let in_flight = self.in_flight(&job.batch_id).await?;
        if self.at_capacity(in_flight) {
            debug!(
                job = %job.job_id,
                batch = %job.batch_id,
                in_flight,
                max = self.max_concurrency,
                "concurrency cap reached, queueing job"
            );
            self.store
                .set_job_status(&job.job_id, JobStatus::QueuedForRun)
                .await?;
            return Ok(JobStatus::QueuedForRun);
        }
        self.dispatch(&job).await?;
        Ok(JobStatus::Triggered)
    }

    /// Dispatch parked jobs oldest first until the cap is reached. Returns
    /// how many were dispatched.
    pub async fn schedule_queued_jobs(&self, batch_id: &BatchId) -> GateResult<usize> {
        let jobs = self.store.jobs_for_batch(batch_id).await?;
        let mut in_flight = jobs.iter().filter(|j| j.status.is_in_flight()).count();
        let mut queued: Vec<&JobRecord> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::QueuedForRun)
            .collect();
        queued.sort_by_key(|j| j.created_at);

        let mut dispatched = 0;
        for job in queued {
            if self.at_capacity(in_flight) {
                break;
            }
            self.dispatch(job).await?;
            in_flight += 1;
            dispatched += 1;
        }
        if dispatched > 0 {
            info!(batch = %batch_id, dispatched, "released queued jobs");
        }
        Ok(dispatched)
    }

    /// Dispatch every `Created` job of a batch through the cap.
    pub async fn schedule_batch(&self, batch_id: &BatchId) -> GateResult<usize> {
        let mut jobs = self.store.jobs_for_batch(batch_id).await?;
        jobs.sort_by_key(|j| j.created_at);
        let mut dispatched = 0;
        for job in jobs.iter().filter(|j| j.status == JobStatus::Created) {
            if self.schedule_job(&job.job_id).await? == JobStatus::Triggered {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Record a job's completion, release parked jobs and refresh the batch
    /// status.
    pub async fn job_finished(&self, job_id: &JobId, succeeded: bool) -> GateResult<BatchStatus> {
        let status = if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.store.set_job_status(job_id, status).await?;
        let job = self.store.get_job(job_id).await?;
        self.schedule_queued_jobs(&job.batch_id).await?;
        self.update_batch_status(&job.batch_id).await
    }

    /// Recompute and persist the batch status from its jobs.
    pub async fn update_batch_status(&self, batch_id: &BatchId) -> GateResult<BatchStatus> {
        let batch = self.store.get_batch(batch_id).await?;
        let statuses: Vec<JobStatus> = self
            .store
            .jobs_for_batch(batch_id)
            .await?
            .iter()
            .map(|j| j.status)
            .collect();
        let next = derive_batch_status(batch.status, &statuses);
        if next != batch.status {
            info!(batch = %batch_id, from = ?batch.status, to = ?next, "batch status changed");
            self.store.set_batch_status(batch_id, next).await?;
        }
        Ok(next)
    }

    async fn in_flight(&self, batch_id: &BatchId) -> GateResult<usize> {
        Ok(self
            .store
            .jobs_for_batch(batch_id)
            .await?
            .iter()
            .filter(|j| j.status.is_in_flight())
            .count())
    }

    fn at_capacity(&self, in_flight: usize) -> bool {
        self.max_concurrency > 0 && in_flight >= self.max_concurrency as usize
    }

    async fn dispatch(&self, job: &JobRecord) -> GateResult<()> {
        let spec = JobSpec::from_value(&job.spec)?;
        if let Err(err) = self.trigger.trigger_workflow(&spec, &self.vcs_token).await {
            warn!(job = %job.job_id, project = %job.project_name, error = %err, "failed to trigger job");
            return Err(err);
        }
        self.store
            .set_job_status(&job.job_id, JobStatus::Triggered)
            .await?;
        info!(job = %job.job_id, project = %job.project_name, "job triggered");
        Ok(())
    }
}
