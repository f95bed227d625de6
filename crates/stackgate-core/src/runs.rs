//! Run state machine and the polling queue processor.
//!
//! [`transition`] is pure: given a run and the observed batch statuses it
//! returns the next status and the side effect to perform.
//! [`RunQueueProcessor`] applies it to the head queue item of every project,
//! claiming each step with a version check so two processors never trigger
//! the same stage twice.

use std::collections::HashSet;
use std::sync::Arc;

use stackgate_state::{
    BatchId, BatchStatus, ProjectRun, RunId, RunQueueItem, RunStatus, RunStore,
    RunType, StorageError,
};
use tracing::{debug, error, info, warn};

use crate::error::{GateError, GateResult};
use crate::scheduler::Scheduler;

/// Batch statuses seen for a run during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub plan_batch: Option<BatchStatus>,
    pub apply_batch: Option<BatchStatus>,
}

/// Side effect of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    TriggerPlan,
    TriggerApply,
    Dequeue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// `None` leaves the status as it is.
    pub next: Option<RunStatus>,
    pub effect: Effect,
}

impl Transition {
    const STAY: Transition = Transition {
        next: None,
        effect: Effect::None,
    };

    fn to(next: RunStatus, effect: Effect) -> Self {
        Self {
            next: Some(next),
            effect,
        }
    }
}

/// One step of the run lifecycle.
///
/// | current | observation | next |
/// |---|---|---|
/// | Queued | | Planning, trigger plan |
/// | Planning | plan failed | Failed, dequeue |
/// | Planning | plan succeeded | PendingApproval / Approved (Succeeded for plan-only) |
/// | PendingApproval | | unchanged |
/// | Approved | | Applying, trigger apply |
/// | Applying | apply failed | Failed, dequeue |
/// | Applying | apply succeeded | Succeeded |
/// | Succeeded, Failed | | dequeue |
pub fn transition(run: &ProjectRun, observed: Observation) -> Transition {
    match run.status {
        RunStatus::Queued => Transition::to(RunStatus::Planning, Effect::TriggerPlan),
        RunStatus::Planning => match observed.plan_batch {
            Some(BatchStatus::Failed) => Transition::to(RunStatus::Failed, Effect::Dequeue),
            Some(BatchStatus::Succeeded) => match run.run_type {
                RunType::PlanOnly => Transition::to(RunStatus::Succeeded, Effect::None),
                RunType::PlanAndApply if run.approval_required => {
                    Transition::to(RunStatus::PendingApproval, Effect::None)
                }
                RunType::PlanAndApply => Transition::to(RunStatus::Approved, Effect::None),
            },
            _ => Transition::STAY,
        },
        RunStatus::PendingApproval => Transition::STAY,
        RunStatus::Approved => Transition::to(RunStatus::Applying, Effect::TriggerApply),
        RunStatus::Applying => match observed.apply_batch {
            Some(BatchStatus::Failed) => Transition::to(RunStatus::Failed, Effect::Dequeue),
            Some(BatchStatus::Succeeded) => Transition::to(RunStatus::Succeeded, Effect::None),
            _ => Transition::STAY,
        },
        RunStatus::Succeeded | RunStatus::Failed => Transition {
            next: None,
            effect: Effect::Dequeue,
        },
        RunStatus::PendingPlan | RunStatus::PendingApply => {
            warn!(run = %run.run_id, status = %run.status, "status not handled by the run queue, leaving unchanged");
            Transition::STAY
        }
    }
}

/// Counters for one [`RunQueueProcessor::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub examined: usize,
    pub advanced: usize,
    pub dequeued: usize,
    /// Items another processor claimed first.
    pub conflicts: usize,
}

/// Advances queued runs, one transition per project per tick.
pub struct RunQueueProcessor {
    runs: Arc<dyn RunStore>,
    scheduler: Arc<Scheduler>,
}

impl RunQueueProcessor {
    /// Batch statuses are read through `scheduler`, which refreshes them
    /// from their jobs first.
    pub fn new(runs: Arc<dyn RunStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { runs, scheduler }
    }

    /// Persist a new run and put it at the back of its project's queue.
    pub async fn submit(&self, run: ProjectRun) -> GateResult<RunQueueItem> {
        self.runs.create_run(run.clone()).await?;
        let item = self.runs.enqueue(&run).await?;
        info!(run = %run.run_id, project = %run.project_name, "run queued");
        Ok(item)
    }

    /// Move a run from PendingApproval to Approved.
    pub async fn approve_run(&self, run_id: &RunId) -> GateResult<ProjectRun> {
        let run = self.runs.get_run(run_id).await?;
        if run.status != RunStatus::PendingApproval {
            return Err(GateError::Config(format!(
                "run {run_id} is not awaiting approval (status {})",
                run.status
            )));
        }
        let approved = self
            .runs
            .compare_and_set_status(run_id, run.version, RunStatus::Approved)
            .await?;
        info!(run = %run_id, project = %run.project_name, "run approved");
        Ok(approved)
    }

    /// One polling pass over the queue. Each `namespace#project` advances
    /// only its earliest item.
    pub async fn tick(&self) -> GateResult<TickReport> {
        let mut report = TickReport::default();
        let mut seen_projects = HashSet::new();

        for item in self.runs.queue_items().await? {
            if !seen_projects.insert(item.project_key()) {
                continue;
            }
            report.examined += 1;
            match self.advance(&item).await {
                Ok(Advance::Moved) => report.advanced += 1,
                Ok(Advance::Dequeued) => report.dequeued += 1,
                Ok(Advance::Idle) => {}
                Err(GateError::Storage(StorageError::VersionConflict { .. })) => {
                    info!(run = %item.run_id, "run claimed by another processor, skipping");
                    report.conflicts += 1;
                }
                Err(err) => {
                    error!(run = %item.run_id, project = %item.project_name, error = %err, "failed to advance run");
                }
            }
        }
        debug!(?report, "run queue tick finished");
        Ok(report)
    }

    async fn advance(&self, item: &RunQueueItem) -> GateResult<Advance> {
        let run = self.runs.get_run(&item.run_id).await?;
        let observed = self.observe(&run).await?;
        let step = transition(&run, observed);

        let run = match step.next {
            Some(next) => {
                let updated = self
                    .runs
                    .compare_and_set_status(&run.run_id, run.version, next)
                    .await?;
                info!(run = %run.run_id, project = %run.project_name, from = %run.status, to = %next, "run transition");
                updated
            }
            None => run,
        };

        match step.effect {
            Effect::None if step.next.is_some() => Ok(Advance::Moved),
            Effect::None => Ok(Advance::Idle),
            Effect::Dequeue => {
                self.runs.dequeue(&item.id).await?;
                info!(run = %run.run_id, project = %run.project_name, status = %run.status, "run dequeued");
                Ok(Advance::Dequeued)
            }
            Effect::TriggerPlan => self.trigger(&run, &run.plan_batch_id, item).await,
            Effect::TriggerApply => match run.apply_batch_id.clone() {
                Some(batch) => self.trigger(&run, &batch, item).await,
                None => {
                    error!(run = %run.run_id, "approved run has no apply batch");
                    self.fail(&run, item).await
                }
            },
        }
    }

    async fn trigger(&self, run: &ProjectRun, batch: &BatchId, item: &RunQueueItem) -> GateResult<Advance> {
        match self.scheduler.schedule_batch(batch).await {
            Ok(dispatched) => {
                info!(run = %run.run_id, batch = %batch, dispatched, "stage triggered");
                Ok(Advance::Moved)
            }
            Err(err) => {
                error!(run = %run.run_id, batch = %batch, error = %err, "failed to trigger stage");
                self.fail(run, item).await
            }
        }
    }

    async fn fail(&self, run: &ProjectRun, item: &RunQueueItem) -> GateResult<Advance> {
        self.runs
            .compare_and_set_status(&run.run_id, run.version, RunStatus::Failed)
            .await?;
        self.runs.dequeue(&item.id).await?;
        Ok(Advance::Dequeued)
    }

    async fn observe(&self, run: &ProjectRun) -> GateResult<Observation> {
        let plan_batch = match run.status {
            RunStatus::Planning => Some(self.scheduler.update_batch_status(&run.plan_batch_id).await?),
            _ => None,
        };
        let apply_batch = match (&run.status, &run.apply_batch_id) {
            (RunStatus::Applying, Some(batch)) => Some(self.scheduler.update_batch_status(batch).await?),
            _ => None,
        };
        Ok(Observation {
            plan_batch,
            apply_batch,
        })
    }
}

enum Advance {
    Idle,
    Moved,
    Dequeued,
}
