//! Persisted records and status enums for batches, jobs and project runs.
//!
//! Status enums serialize to the exact strings stored by existing
//! deployments, so rows written by older schedulers stay readable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a [`BatchRecord`].
    BatchId
);
string_id!(
    /// Identifier of a [`JobRecord`].
    JobId
);
string_id!(
    /// Identifier of a [`ProjectRun`].
    RunId
);
string_id!(
    /// Identifier of a [`RunQueueItem`].
    QueueItemId
);

// ---------------------------------------------------------------------------
// Jobs and batches
// ---------------------------------------------------------------------------

/// Lifecycle of a single dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Triggered,
    Failed,
    Started,
    Succeeded,
    /// Held back by the per-batch concurrency cap.
    QueuedForRun,
}

impl JobStatus {
    /// Triggered or Started: the job occupies a concurrency slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobStatus::Triggered | JobStatus::Started)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Aggregate status of a batch, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    Started,
    Failed,
    Succeeded,
    Invalidated,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Succeeded | BatchStatus::Invalidated
        )
    }
}

/// Command type shared by every job in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Plan,
    Apply,
}

/// A group of jobs triggered by one VCS event for one command type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    /// Repository scope, e.g. `"myorg/myrepo"`.
    pub namespace: String,
    pub pr_number: Option<u64>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(batch_type: BatchType, namespace: impl Into<String>) -> Self {
        Self {
            batch_id: BatchId::new(),
            batch_type,
            status: BatchStatus::Created,
            namespace: namespace.into(),
            pr_number: None,
            branch: None,
            created_at: Utc::now(),
        }
    }
}

/// One project's job inside a batch.
///
/// `spec` holds the serialized dispatch spec; the persistence layer treats
/// it as opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub project_name: String,
    pub status: JobStatus,
    pub spec: serde_json::Value,
    /// Display name used for the CI workflow run.
    pub run_name: String,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        batch_id: BatchId,
        project_name: impl Into<String>,
        spec: serde_json::Value,
        run_name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            batch_id,
            project_name: project_name.into(),
            status: JobStatus::Created,
            spec,
            run_name: run_name.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Project runs
// ---------------------------------------------------------------------------

/// Status of a [`ProjectRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    #[serde(rename = "Pending Plan")]
    PendingPlan,
    #[serde(rename = "Running Plan")]
    Planning,
    #[serde(rename = "Pending Approval")]
    PendingApproval,
    Approved,
    #[serde(rename = "Pending Apply")]
    PendingApply,
    #[serde(rename = "Running Apply")]
    Applying,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Queued,
        RunStatus::PendingPlan,
        RunStatus::Planning,
        RunStatus::PendingApproval,
        RunStatus::Approved,
        RunStatus::PendingApply,
        RunStatus::Applying,
        RunStatus::Succeeded,
        RunStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "Queued",
            RunStatus::PendingPlan => "Pending Plan",
            RunStatus::Planning => "Running Plan",
            RunStatus::PendingApproval => "Pending Approval",
            RunStatus::Approved => "Approved",
            RunStatus::PendingApply => "Pending Apply",
            RunStatus::Applying => "Running Apply",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StorageError::UnknownStatus {
                kind: "run",
                value: s.to_string(),
            })
    }
}

/// Whether a run stops after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    PlanAndApply,
    PlanOnly,
}

/// A project's plan → approval → apply lifecycle.
///
/// `version` is bumped on every status write; see
/// [`crate::store::RunStore::compare_and_set_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRun {
    pub run_id: RunId,
    pub project_name: String,
    pub namespace: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub approval_required: bool,
    pub plan_batch_id: BatchId,
    pub apply_batch_id: Option<BatchId>,
    pub commit_sha: Option<String>,
    pub pr_number: Option<u64>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl ProjectRun {
    /// A fresh run in `Queued` status at version 0.
    pub fn new(
        project_name: impl Into<String>,
        namespace: impl Into<String>,
        run_type: RunType,
        plan_batch_id: BatchId,
        apply_batch_id: Option<BatchId>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            project_name: project_name.into(),
            namespace: namespace.into(),
            run_type,
            status: RunStatus::Queued,
            approval_required: true,
            plan_batch_id,
            apply_batch_id,
            commit_sha: None,
            pr_number: None,
            version: 0,
            created_at: Utc::now(),
        }
    }
}

/// FIFO ticket for a run. Only the earliest ticket per project advances;
/// a project is identified by its namespace and name together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueueItem {
    pub id: QueueItemId,
    #[serde(default)]
    pub namespace: String,
    pub project_name: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
}

impl RunQueueItem {
    /// A fresh ticket for `run`.
    pub fn for_run(run: &ProjectRun) -> Self {
        Self {
            id: QueueItemId::new(),
            namespace: run.namespace.clone(),
            project_name: run.project_name.clone(),
            run_id: run.run_id.clone(),
            created_at: Utc::now(),
        }
    }

    /// `namespace#project`, the same key the project lock uses.
    pub fn project_key(&self) -> String {
        format!("{}#{}", self.namespace, self.project_name)
    }
}
