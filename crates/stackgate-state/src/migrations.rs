//! SurrealDB schema initialization
//!
//! Safe to call on every connection; every statement is idempotent.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::store::StorageResult;

/// Define all stackgate tables and indexes.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing stackgate SurrealDB schema");

    init_batches_table(db).await?;
    init_jobs_table(db).await?;
    init_runs_table(db).await?;
    init_run_queue_table(db).await?;

    info!("stackgate schema initialization complete");
    Ok(())
}

async fn init_batches_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing batches table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS batches SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_batch_id ON TABLE batches COLUMNS batch_id UNIQUE;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

async fn init_jobs_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing jobs table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS jobs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE jobs COLUMNS job_id UNIQUE;
        -- Scheduler counts in-flight jobs per batch
        DEFINE INDEX IF NOT EXISTS idx_job_batch_status ON TABLE jobs COLUMNS batch_id, status;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

/// `runs.version` backs the compare-and-set in
/// [`crate::store::RunStore::compare_and_set_status`].
async fn init_runs_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing runs table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_id_version ON TABLE runs COLUMNS run_id, version;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

async fn init_run_queue_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing run_queue table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_queue SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_item_id ON TABLE run_queue COLUMNS item_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_queue_project ON TABLE run_queue COLUMNS namespace, project_name, created_at;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}
