//! SurrealDB row shapes for the stackgate tables.
//!
//! Tables:
//! - batches: one row per batch
//! - jobs: one row per job, keyed back to its batch
//! - runs: project runs with a status version
//! - run_queue: FIFO tickets per project
//!
//! Rows mirror the public records but store timestamps as native SurrealDB
//! datetimes so `ORDER BY created_at` is chronological.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::records::*;

/// chrono <-> SurrealDB datetime.
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SurrealDatetime::from(*date).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BatchRow {
    #[serde(default, skip_serializing)]
    pub id: Option<Thing>,
    pub batch_id: String,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub namespace: String,
    pub pr_number: Option<u64>,
    pub branch: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<BatchRecord> for BatchRow {
    fn from(b: BatchRecord) -> Self {
        Self {
            id: None,
            batch_id: b.batch_id.0,
            batch_type: b.batch_type,
            status: b.status,
            namespace: b.namespace,
            pr_number: b.pr_number,
            branch: b.branch,
            created_at: b.created_at,
        }
    }
}

impl From<BatchRow> for BatchRecord {
    fn from(r: BatchRow) -> Self {
        Self {
            batch_id: BatchId(r.batch_id),
            batch_type: r.batch_type,
            status: r.status,
            namespace: r.namespace,
            pr_number: r.pr_number,
            branch: r.branch,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRow {
    #[serde(default, skip_serializing)]
    pub id: Option<Thing>,
    pub job_id: String,
    pub batch_id: String,
    pub project_name: String,
    pub status: JobStatus,
    pub spec: serde_json::Value,
    pub run_name: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<JobRecord> for JobRow {
    fn from(j: JobRecord) -> Self {
        Self {
            id: None,
            job_id: j.job_id.0,
            batch_id: j.batch_id.0,
            project_name: j.project_name,
            status: j.status,
            spec: j.spec,
            run_name: j.run_name,
            created_at: j.created_at,
        }
    }
}

impl From<JobRow> for JobRecord {
    fn from(r: JobRow) -> Self {
        Self {
            job_id: JobId(r.job_id),
            batch_id: BatchId(r.batch_id),
            project_name: r.project_name,
            status: r.status,
            spec: r.spec,
            run_name: r.run_name,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunRow {
    #[serde(default, skip_serializing)]
    pub id: Option<Thing>,
    pub run_id: String,
    pub project_name: String,
    pub namespace: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub approval_required: bool,
    pub plan_batch_id: String,
    pub apply_batch_id: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_number: Option<u64>,
    pub version: u64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<ProjectRun> for RunRow {
    fn from(r: ProjectRun) -> Self {
        Self {
            id: None,
            run_id: r.run_id.0,
            project_name: r.project_name,
            namespace: r.namespace,
            run_type: r.run_type,
            status: r.status,
            approval_required: r.approval_required,
            plan_batch_id: r.plan_batch_id.0,
            apply_batch_id: r.apply_batch_id.map(|b| b.0),
            commit_sha: r.commit_sha,
            pr_number: r.pr_number,
            version: r.version,
            created_at: r.created_at,
        }
    }
}

impl From<RunRow> for ProjectRun {
    fn from(r: RunRow) -> Self {
        Self {
            run_id: RunId(r.run_id),
            project_name: r.project_name,
            namespace: r.namespace,
            run_type: r.run_type,
            status: r.status,
            approval_required: r.approval_required,
            plan_batch_id: BatchId(r.plan_batch_id),
            apply_batch_id: r.apply_batch_id.map(BatchId),
            commit_sha: r.commit_sha,
            pr_number: r.pr_number,
            version: r.version,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueueRow {
    #[serde(default, skip_serializing)]
    pub id: Option<Thing>,
    pub item_id: String,
    #[serde(default)]
    pub namespace: String,
    pub project_name: String,
    pub run_id: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<RunQueueItem> for QueueRow {
    fn from(i: RunQueueItem) -> Self {
        Self {
            id: None,
            item_id: i.id.0,
            namespace: i.namespace,
            project_name: i.project_name,
            run_id: i.run_id.0,
            created_at: i.created_at,
        }
    }
}

impl From<QueueRow> for RunQueueItem {
    fn from(r: QueueRow) -> Self {
        Self {
            id: QueueItemId(r.item_id),
            namespace: r.namespace,
            project_name: r.project_name,
            run_id: RunId(r.run_id),
            created_at: r.created_at,
        }
    }
}
