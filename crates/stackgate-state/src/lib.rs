//! Stackgate-State: persistence for batches, jobs and project runs
//!
//! The orchestration core never talks to a database directly. It reads and
//! writes through the traits in [`store`]; this crate provides in-memory
//! fakes, a filesystem plan store, and a SurrealDB implementation.
//!
//! ## Key Components
//!
//! - [`records`]: ids, status enums and record structs
//! - [`store`]: `JobStore`, `RunStore`, `PlanStorage`
//! - [`SurrealStore`]: SurrealDB-backed job and run store

mod error;
pub mod fakes;
mod fs_plans;
pub mod migrations;
pub mod records;
mod schema;
pub mod store;
pub mod surreal_store;

pub use error::StorageError;
pub use fs_plans::FsPlanStorage;
pub use records::{
    BatchId, BatchRecord, BatchStatus, BatchType, JobId, JobRecord, JobStatus, ProjectRun,
    QueueItemId, RunId, RunQueueItem, RunStatus, RunType,
};
pub use store::{JobStore, PlanStorage, RunStore, StorageResult};
pub use surreal_store::SurrealStore;
