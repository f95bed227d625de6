//! Executor collaborator contract and the lock gate in front of it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::GateResult;
use crate::jobs::Job;
use crate::locking::ProjectLock;

/// Outcome of a plan attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanOutcome {
    /// False when nothing ran, e.g. the project lock was held elsewhere.
    pub performed: bool,
    /// The plan contains changes.
    pub non_empty: bool,
    pub output: String,
    pub plan_json: String,
}

/// Outcome of an apply attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub performed: bool,
    pub output: String,
}

/// Runs infrastructure tooling for one job.
///
/// `Err` means the tool failed. Skipped work is `performed == false`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn plan(&self, job: &Job) -> GateResult<PlanOutcome>;

    async fn apply(&self, job: &Job) -> GateResult<ApplyOutcome>;

    /// `Ok(true)` when the destroy ran.
    async fn destroy(&self, job: &Job) -> GateResult<bool>;
}

/// Takes the project lock before every plan, apply and destroy.
///
/// A lock held by another PR is not an error: the call reports nothing
/// performed and the inner executor is never reached.
pub struct LockingExecutor {
    lock: ProjectLock,
    inner: Arc<dyn Executor>,
}

impl LockingExecutor {
    pub fn new(lock: ProjectLock, inner: Arc<dyn Executor>) -> Self {
        Self { lock, inner }
    }

    async fn acquire(&self, command: &str) -> GateResult<bool> {
        let locked = self.lock.lock().await?;
        if !locked {
            info!(
                project = %self.lock.project_name(),
                pr = self.lock.pr_number(),
                command,
                "skipping command, project is locked"
            );
        }
        Ok(locked)
    }
}

#[async_trait]
impl Executor for LockingExecutor {
    async fn plan(&self, job: &Job) -> GateResult<PlanOutcome> {
        if !self.acquire("plan").await? {
            return Ok(PlanOutcome::default());
        }
        self.inner.plan(job).await
    }

    async fn apply(&self, job: &Job) -> GateResult<ApplyOutcome> {
        if !self.acquire("apply").await? {
            return Ok(ApplyOutcome {
                performed: false,
                output: format!("couldn't lock project {}", self.lock.lock_id()),
            });
        }
        self.inner.apply(job).await
    }

    async fn destroy(&self, job: &Job) -> GateResult<bool> {
        if !self.acquire("destroy").await? {
            return Ok(false);
        }
        self.inner.destroy(job).await
    }
}
