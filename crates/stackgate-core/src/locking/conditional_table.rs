//! Conditional-write key/value table backend.
//!
//! Row layout (compatible with existing deployments):
//!
//! ```text
//! PK = "LOCK"   SK = "RES#<resource>"   transaction_id: number   timeout: RFC3339
//! ```
//!
//! Acquire writes the row under the condition
//! `attribute_not_exists(SK) OR timeout < :now`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::LockBackend;
use crate::error::{GateError, GateResult};

pub const LOCK_PARTITION_KEY: &str = "LOCK";
pub const LOCK_TTL_DAYS: i64 = 90;

const TABLE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const TABLE_POLL_ATTEMPTS: usize = 10;

/// Composite primary key of a lock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub pk: String,
    pub sk: String,
}

impl TableKey {
    pub fn for_resource(resource: &str) -> Self {
        Self {
            pk: LOCK_PARTITION_KEY.to_string(),
            sk: format!("RES#{resource}"),
        }
    }
}

/// Lock row attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct LockItem {
    pub transaction_id: u64,
    /// RFC3339 expiry timestamp.
    pub timeout: String,
}

impl LockItem {
    /// True when `timeout` parses and lies before `now`. Unparseable
    /// timeouts are treated as live.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.timeout)
            .map(|t| t.with_timezone(&Utc) < now)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Creating,
    Active,
}

/// Result of a conditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    ConditionFailed,
}

/// The subset of a conditional-write table API the backend needs.
#[async_trait]
pub trait ConditionalTableClient: Send + Sync {
    /// `None` when the table does not exist.
    async fn describe_table(&self, table: &str) -> GateResult<Option<TableStatus>>;

    async fn create_table(&self, table: &str) -> GateResult<()>;

    /// Write `item` at `key` iff the row is absent or its timeout is before
    /// `now`.
    async fn put_if_absent_or_expired(
        &self,
        table: &str,
        key: &TableKey,
        item: LockItem,
        now: DateTime<Utc>,
    ) -> GateResult<PutOutcome>;

    async fn get_item(
        &self,
        table: &str,
        key: &TableKey,
        consistent_read: bool,
    ) -> GateResult<Option<LockItem>>;

    async fn delete_item(&self, table: &str, key: &TableKey) -> GateResult<()>;
}

/// [`LockBackend`] over a [`ConditionalTableClient`]. Creates the table on
/// first use.
pub struct ConditionalTableBackend {
    client: Arc<dyn ConditionalTableClient>,
    table: String,
    ready: OnceCell<()>,
}

impl ConditionalTableBackend {
    pub fn new(client: Arc<dyn ConditionalTableClient>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> GateResult<()> {
        self.ready
            .get_or_try_init(|| async {
                match self.client.describe_table(&self.table).await? {
                    Some(TableStatus::Active) => return Ok(()),
                    Some(TableStatus::Creating) => {}
                    None => {
                        info!(table = %self.table, "creating lock table");
                        self.client.create_table(&self.table).await?;
                    }
                }
                self.wait_until_active().await
            })
            .await
            .map(|_| ())
    }

    async fn wait_until_active(&self) -> GateResult<()> {
        for attempt in 0..TABLE_POLL_ATTEMPTS {
            if self.client.describe_table(&self.table).await? == Some(TableStatus::Active) {
                return Ok(());
            }
            debug!(table = %self.table, attempt, "waiting for lock table");
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }
        warn!(table = %self.table, "lock table creation timed out");
        Err(GateError::LockBackend(format!(
            "table {} did not become active",
            self.table
        )))
    }
}

#[async_trait]
impl LockBackend for ConditionalTableBackend {
    async fn acquire(&self, resource: &str, owner: u64, ttl: Option<Duration>) -> GateResult<bool> {
        self.ensure_table().await?;
        let now = Utc::now();
        let ttl = ttl.unwrap_or_else(|| Duration::days(LOCK_TTL_DAYS));
        let item = LockItem {
            transaction_id: owner,
            timeout: (now + ttl).to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let outcome = self
            .client
            .put_if_absent_or_expired(&self.table, &TableKey::for_resource(resource), item, now)
            .await?;
        Ok(outcome == PutOutcome::Written)
    }

    async fn release(&self, resource: &str) -> GateResult<bool> {
        self.ensure_table().await?;
        self.client
            .delete_item(&self.table, &TableKey::for_resource(resource))
            .await?;
        Ok(true)
    }

    async fn read(&self, resource: &str) -> GateResult<Option<u64>> {
        self.ensure_table().await?;
        let item = self
            .client
            .get_item(&self.table, &TableKey::for_resource(resource), true)
            .await?;
        Ok(item
            .filter(|i| i.transaction_id != 0 && !i.is_expired(Utc::now()))
            .map(|i| i.transaction_id))
    }

    fn name(&self) -> &'static str {
        "conditional-table"
    }
}

// ---------------------------------------------------------------------------
// MemoryConditionalTable
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, HashMap<TableKey, LockItem>>,
    fail_next: Option<String>,
}

/// In-memory [`ConditionalTableClient`]. Tables become active immediately.
#[derive(Debug, Default)]
pub struct MemoryConditionalTable {
    inner: Mutex<Tables>,
}

impl MemoryConditionalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with a transport error.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.guard().fail_next = Some(message.into());
    }

    /// Seed a row directly, bypassing the condition.
    pub fn insert(&self, table: &str, resource: &str, item: LockItem) {
        self.guard()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(TableKey::for_resource(resource), item);
    }

    pub fn table_count(&self) -> usize {
        self.guard().tables.len()
    }

    fn guard(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked(&self) -> GateResult<MutexGuard<'_, Tables>> {
        let mut inner = self.guard();
        match inner.fail_next.take() {
            Some(msg) => Err(GateError::LockBackend(msg)),
            None => Ok(inner),
        }
    }
}

#[async_trait]
impl ConditionalTableClient for MemoryConditionalTable {
    async fn describe_table(&self, table: &str) -> GateResult<Option<TableStatus>> {
        let inner = self.checked()?;
        Ok(inner.tables.contains_key(table).then_some(TableStatus::Active))
    }

    async fn create_table(&self, table: &str) -> GateResult<()> {
        self.checked()?.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn put_if_absent_or_expired(
        &self,
        table: &str,
        key: &TableKey,
        item: LockItem,
        now: DateTime<Utc>,
    ) -> GateResult<PutOutcome> {
        let mut inner = self.checked()?;
        let rows = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| GateError::LockBackend(format!("table {table} not found")))?;
        if let Some(existing) = rows.get(key) {
            if !existing.is_expired(now) {
                return Ok(PutOutcome::ConditionFailed);
            }
        }
        rows.insert(key.clone(), item);
        Ok(PutOutcome::Written)
    }

    async fn get_item(
        &self,
        table: &str,
        key: &TableKey,
        _consistent_read: bool,
    ) -> GateResult<Option<LockItem>> {
        let inner = self.checked()?;
        Ok(inner.tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn delete_item(&self, table: &str, key: &TableKey) -> GateResult<()> {
        let mut inner = self.checked()?;
        if let Some(rows) = inner.tables.get_mut(table) {
            rows.remove(key);
        }
        Ok(())
    }
}
