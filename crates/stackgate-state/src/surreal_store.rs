//! SurrealDB-backed `JobStore` and `RunStore`.
//!
//! The run status compare-and-set is a single `UPDATE ... WHERE version =
//! $expected` statement, so concurrent queue processors pointed at the same
//! database cannot both advance one run.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::records::*;
use crate::schema::{BatchRow, JobRow, QueueRow, RunRow};
use crate::store::{JobStore, RunStore, StorageResult};

/// SurrealDB implementation of the job and run stores.
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// In-memory instance (`mem://`), used by tests and dry runs.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://", "stackgate", "main").await
    }

    /// Connect to `endpoint` (any scheme the `any` engine accepts), select
    /// the namespace and database, and initialise the schema.
    pub async fn connect(endpoint: &str, namespace: &str, database: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(endpoint)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        db.use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!(endpoint, namespace, database, "SurrealStore connected");
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn select_where<T: DeserializeOwned>(
        &self,
        sql: &'static str,
        key: &'static str,
        value: String,
    ) -> StorageResult<Vec<T>> {
        let mut res = self.db.query(sql).bind((key, value)).await?;
        Ok(res.take(0)?)
    }

    async fn fetch_run(&self, run_id: &RunId) -> StorageResult<RunRow> {
        let rows: Vec<RunRow> = self
            .select_where("SELECT * FROM runs WHERE run_id = $rid", "rid", run_id.0.clone())
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("run", run_id.as_str()))
    }
}

#[async_trait]
impl JobStore for SurrealStore {
    async fn create_batch(&self, batch: BatchRecord) -> StorageResult<()> {
        debug!(batch_id = %batch.batch_id, "creating batch");
        self.db
            .query("CREATE batches CONTENT $row")
            .bind(("row", BatchRow::from(batch)))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: &BatchId) -> StorageResult<BatchRecord> {
        let rows: Vec<BatchRow> = self
            .select_where(
                "SELECT * FROM batches WHERE batch_id = $bid",
                "bid",
                batch_id.0.clone(),
            )
            .await?;
        rows.into_iter()
            .next()
            .map(BatchRecord::from)
            .ok_or_else(|| StorageError::not_found("batch", batch_id.as_str()))
    }

    async fn set_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
    ) -> StorageResult<()> {
        let mut res = self
            .db
            .query("UPDATE batches SET status = $status WHERE batch_id = $bid RETURN AFTER")
            .bind(("status", status))
            .bind(("bid", batch_id.0.clone()))
            .await?;
        let rows: Vec<BatchRow> = res.take(0)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("batch", batch_id.as_str()));
        }
        Ok(())
    }

    async fn create_job(&self, job: JobRecord) -> StorageResult<()> {
        debug!(job_id = %job.job_id, batch_id = %job.batch_id, "creating job");
        self.db
            .query("CREATE jobs CONTENT $row")
            .bind(("row", JobRow::from(job)))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let rows: Vec<JobRow> = self
            .select_where("SELECT * FROM jobs WHERE job_id = $jid", "jid", job_id.0.clone())
            .await?;
        rows.into_iter()
            .next()
            .map(JobRecord::from)
            .ok_or_else(|| StorageError::not_found("job", job_id.as_str()))
    }

    async fn jobs_for_batch(&self, batch_id: &BatchId) -> StorageResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = self
            .select_where(
                "SELECT * FROM jobs WHERE batch_id = $bid ORDER BY created_at ASC",
                "bid",
                batch_id.0.clone(),
            )
            .await?;
        Ok(rows.into_iter().map(JobRecord::from).collect())
    }

    async fn set_job_status(&self, job_id: &JobId, status: JobStatus) -> StorageResult<()> {
        let mut res = self
            .db
            .query("UPDATE jobs SET status = $status WHERE job_id = $jid RETURN AFTER")
            .bind(("status", status))
            .bind(("jid", job_id.0.clone()))
            .await?;
        let rows: Vec<JobRow> = res.take(0)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("job", job_id.as_str()));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for SurrealStore {
    async fn create_run(&self, run: ProjectRun) -> StorageResult<()> {
        debug!(run_id = %run.run_id, project = %run.project_name, "creating run");
        self.db
            .query("CREATE runs CONTENT $row")
            .bind(("row", RunRow::from(run)))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<ProjectRun> {
        self.fetch_run(run_id).await.map(ProjectRun::from)
    }

    async fn compare_and_set_status(
        &self,
        run_id: &RunId,
        expected_version: u64,
        status: RunStatus,
    ) -> StorageResult<ProjectRun> {
        let mut res = self
            .db
            .query(
                "UPDATE runs SET status = $status, version = version + 1 \
                 WHERE run_id = $rid AND version = $expected RETURN AFTER",
            )
            .bind(("status", status))
            .bind(("rid", run_id.0.clone()))
            .bind(("expected", expected_version))
            .await?;
        let rows: Vec<RunRow> = res.take(0)?;
        if let Some(row) = rows.into_iter().next() {
            return Ok(row.into());
        }

        // Nothing matched: either the run is gone or another writer won.
        let current = self.fetch_run(run_id).await?;
        Err(StorageError::VersionConflict {
            run_id: run_id.to_string(),
            expected: expected_version,
            actual: current.version,
        })
    }

    async fn enqueue(&self, run: &ProjectRun) -> StorageResult<RunQueueItem> {
        let item = RunQueueItem::for_run(run);
        self.db
            .query("CREATE run_queue CONTENT $row")
            .bind(("row", QueueRow::from(item.clone())))
            .await?
            .check()?;
        Ok(item)
    }

    async fn queue_items(&self) -> StorageResult<Vec<RunQueueItem>> {
        let mut res = self
            .db
            .query("SELECT * FROM run_queue ORDER BY created_at ASC")
            .await?;
        let rows: Vec<QueueRow> = res.take(0)?;
        Ok(rows.into_iter().map(RunQueueItem::from).collect())
    }

    async fn dequeue(&self, item_id: &QueueItemId) -> StorageResult<()> {
        self.db
            .query("DELETE run_queue WHERE item_id = $iid")
            .bind(("iid", item_id.0.clone()))
            .await?
            .check()?;
        Ok(())
    }
}
