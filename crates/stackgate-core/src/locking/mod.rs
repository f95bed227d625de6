//! Mutual exclusion for projects.
//!
//! Three layers, leaf first:
//!
//! - [`LockBackend`]: raw conditional acquire/release/read against one store
//!   ([`ConditionalTableBackend`], [`EntityTableBackend`],
//!   [`ObjectStoreBackend`]). [`DynamoDbTable`] is the built-in client for
//!   the conditional table.
//! - [`DistributedLock`]: the owner-keyed contract the rest of the crate
//!   uses, either [`BackendLock`] or [`NoOpLock`].
//! - [`ProjectLock`]: one project within one change request, with
//!   hanging-lock recovery and PR notices.
//!
//! No layer retries. An acquire is always a single attempt.

mod conditional_table;
mod dynamodb;
mod entity_table;
mod factory;
mod object_store;
mod project;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;

use crate::error::GateResult;

pub use conditional_table::{
    ConditionalTableBackend, ConditionalTableClient, LockItem, MemoryConditionalTable,
    PutOutcome, TableKey, TableStatus, LOCK_PARTITION_KEY, LOCK_TTL_DAYS,
};
pub use dynamodb::DynamoDbTable;
pub use entity_table::{
    EntityTableBackend, EntityTableClient, InsertOutcome, LockEntity, MemoryEntityTable,
    ENTITY_PARTITION_KEY,
};
pub use factory::{build_lock, LockClients};
pub use object_store::{
    CreateOutcome, LockObject, MemoryObjectStore, ObjectStoreBackend, ObjectStoreClient,
};
pub use project::{lock_id, ProjectLock};

/// Raw lock store.
///
/// Guarantees:
/// - `acquire` is a conditional write: it succeeds only when no live entry
///   exists for `resource`. Concurrent callers on any host get at most one
///   `Ok(true)`.
/// - `Ok(false)` means a genuine conflict. Transport failures are `Err`.
/// - `read` never reports an entry whose TTL has elapsed.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn acquire(&self, resource: &str, owner: u64, ttl: Option<Duration>) -> GateResult<bool>;

    async fn release(&self, resource: &str) -> GateResult<bool>;

    async fn read(&self, resource: &str) -> GateResult<Option<u64>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Owner-keyed lock contract.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Current owner of `resource`, if any.
    async fn get_lock(&self, resource: &str) -> GateResult<Option<u64>>;

    /// Single acquire attempt for `owner`.
    async fn lock(&self, owner: u64, resource: &str) -> GateResult<bool>;

    async fn unlock(&self, resource: &str) -> GateResult<bool>;

    /// True when locking is administratively disabled.
    fn is_noop(&self) -> bool {
        false
    }
}

/// [`DistributedLock`] over a [`LockBackend`] with a fixed TTL.
pub struct BackendLock {
    backend: Arc<dyn LockBackend>,
    ttl: Option<Duration>,
}

impl BackendLock {
    pub fn new(backend: Arc<dyn LockBackend>, ttl: Option<Duration>) -> Self {
        Self { backend, ttl }
    }
}

#[async_trait]
impl DistributedLock for BackendLock {
    async fn get_lock(&self, resource: &str) -> GateResult<Option<u64>> {
        self.backend.read(resource).await
    }

    async fn lock(&self, owner: u64, resource: &str) -> GateResult<bool> {
        let acquired = self.backend.acquire(resource, owner, self.ttl).await?;
        debug!(backend = self.backend.name(), resource, owner, acquired, "lock attempt");
        Ok(acquired)
    }

    async fn unlock(&self, resource: &str) -> GateResult<bool> {
        let released = self.backend.release(resource).await?;
        debug!(backend = self.backend.name(), resource, released, "unlock attempt");
        Ok(released)
    }
}

/// Always succeeds and never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLock;

#[async_trait]
impl DistributedLock for NoOpLock {
    async fn get_lock(&self, _resource: &str) -> GateResult<Option<u64>> {
        Ok(None)
    }

    async fn lock(&self, _owner: u64, _resource: &str) -> GateResult<bool> {
        Ok(true)
    }

    async fn unlock(&self, _resource: &str) -> GateResult<bool> {
        Ok(true)
    }

    fn is_noop(&self) -> bool {
        true
    }
}
