//! Structured-storage table backend.
//!
//! One entity per resource: `{PartitionKey: "digger", RowKey: resource,
//! transaction_id}`. Acquire is an insert that fails when the row exists.
//! Entries have no TTL and must be released explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::LockBackend;
use crate::error::{GateError, GateResult};

pub const ENTITY_PARTITION_KEY: &str = "digger";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntity {
    pub partition_key: String,
    pub row_key: String,
    pub transaction_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The service answered `EntityAlreadyExists`.
    AlreadyExists,
}

/// The subset of a table-storage API the backend needs.
#[async_trait]
pub trait EntityTableClient: Send + Sync {
    async fn table_exists(&self, table: &str) -> GateResult<bool>;

    async fn create_table(&self, table: &str) -> GateResult<()>;

    async fn add_entity(&self, table: &str, entity: LockEntity) -> GateResult<InsertOutcome>;

    async fn delete_entity(&self, table: &str, partition_key: &str, row_key: &str)
        -> GateResult<()>;

    /// Entities matching `PartitionKey eq '<pk>' and RowKey eq '<rk>'`.
    async fn query_entities(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> GateResult<Vec<LockEntity>>;
}

pub struct EntityTableBackend {
    client: Arc<dyn EntityTableClient>,
    table: String,
    ready: OnceCell<()>,
}

impl EntityTableBackend {
    pub fn new(client: Arc<dyn EntityTableClient>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> GateResult<()> {
        self.ready
            .get_or_try_init(|| async {
                if !self.client.table_exists(&self.table).await? {
                    info!(table = %self.table, "creating lock table");
                    self.client.create_table(&self.table).await?;
                }
                Ok::<(), GateError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LockBackend for EntityTableBackend {
    async fn acquire(&self, resource: &str, owner: u64, ttl: Option<Duration>) -> GateResult<bool> {
        if ttl.is_some() {
            warn!(resource, "entity table locks have no TTL, ignoring");
        }
        self.ensure_table().await?;
        let entity = LockEntity {
            partition_key: ENTITY_PARTITION_KEY.to_string(),
            row_key: resource.to_string(),
            transaction_id: owner,
        };
        let outcome = self.client.add_entity(&self.table, entity).await?;
        Ok(outcome == InsertOutcome::Inserted)
    }

    async fn release(&self, resource: &str) -> GateResult<bool> {
        self.ensure_table().await?;
        self.client
            .delete_entity(&self.table, ENTITY_PARTITION_KEY, resource)
            .await?;
        Ok(true)
    }

    async fn read(&self, resource: &str) -> GateResult<Option<u64>> {
        self.ensure_table().await?;
        let entities = self
            .client
            .query_entities(&self.table, ENTITY_PARTITION_KEY, resource)
            .await?;
        Ok(entities.first().map(|e| e.transaction_id))
    }

    fn name(&self) -> &'static str {
        "entity-table"
    }
}

// ---------------------------------------------------------------------------
// MemoryEntityTable
// ---------------------------------------------------------------------------

type EntityKey = (String, String);

/// In-memory [`EntityTableClient`].
#[derive(Debug, Default)]
pub struct MemoryEntityTable {
    tables: Mutex<HashMap<String, HashMap<EntityKey, LockEntity>>>,
}

impl MemoryEntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, HashMap<EntityKey, LockEntity>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn missing_table(table: &str) -> GateError {
    GateError::LockBackend(format!("TableNotFound: {table}"))
}

#[async_trait]
impl EntityTableClient for MemoryEntityTable {
    async fn table_exists(&self, table: &str) -> GateResult<bool> {
        Ok(self.guard().contains_key(table))
    }

    async fn create_table(&self, table: &str) -> GateResult<()> {
        self.guard().entry(table.to_string()).or_default();
        Ok(())
    }

    async fn add_entity(&self, table: &str, entity: LockEntity) -> GateResult<InsertOutcome> {
        let mut tables = self.guard();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if rows.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        rows.insert(key, entity);
        Ok(InsertOutcome::Inserted)
    }

    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> GateResult<()> {
        let mut tables = self.guard();
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        rows.remove(&(partition_key.to_string(), row_key.to_string()));
        Ok(())
    }

    async fn query_entities(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> GateResult<Vec<LockEntity>> {
        let tables = self.guard();
        let rows = tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(rows
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_conflict_is_not_an_error() {
        let backend = EntityTableBackend::new(Arc::new(MemoryEntityTable::new()), "DIGGERLOCK");
        assert!(backend.acquire("org/repo#dev", 3, None).await.unwrap());
        assert!(!backend.acquire("org/repo#dev", 4, None).await.unwrap());
        assert_eq!(backend.read("org/repo#dev").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn release_then_reacquire() {
        let client = Arc::new(MemoryEntityTable::new());
        let backend = EntityTableBackend::new(client.clone(), "DIGGERLOCK");
        backend.acquire("r", 3, None).await.unwrap();
        assert!(backend.release("r").await.unwrap());
        assert_eq!(backend.read("r").await.unwrap(), None);
        assert!(backend.acquire("r", 4, None).await.unwrap());
        assert!(client.table_exists("DIGGERLOCK").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_get_exactly_one_winner() {
        let backend = Arc::new(EntityTableBackend::new(Arc::new(MemoryEntityTable::new()), "DIGGERLOCK"));
        let handles: Vec<_> = (1..=16u64)
            .map(|owner| {
                let backend = backend.clone();
                tokio::spawn(async move { (owner, backend.acquire("r", owner, None).await) })
            })
            .collect();
        let mut winners = Vec::new();
        for handle in handles {
            let (owner, acquired) = handle.await.unwrap();
            if acquired.unwrap() {
                winners.push(owner);
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(backend.read("r").await.unwrap(), Some(winners[0]));
    }
}
