//! Builds the configured [`DistributedLock`].

use std::sync::Arc;

use tracing::info;

use super::{
    BackendLock, ConditionalTableBackend, ConditionalTableClient, DistributedLock, DynamoDbTable,
    EntityTableBackend, EntityTableClient, NoOpLock, ObjectStoreBackend, ObjectStoreClient,
};
use crate::config::LockConfig;
use crate::error::{GateError, GateResult};

/// Store clients available to the factory. Only the one matching the
/// configured provider has to be present.
#[derive(Clone, Default)]
pub struct LockClients {
    pub conditional_table: Option<Arc<dyn ConditionalTableClient>>,
    pub entity_table: Option<Arc<dyn EntityTableClient>>,
    pub object_store: Option<Arc<dyn ObjectStoreClient>>,
}

impl LockClients {
    /// Built-in clients for `config`. Only `aws` has one; `azure` and `gcp`
    /// clients must be supplied by the caller.
    pub async fn for_provider(config: &LockConfig) -> Self {
        match config {
            LockConfig::Aws { table } => {
                info!(table = %table, "using dynamodb lock table");
                Self {
                    conditional_table: Some(Arc::new(DynamoDbTable::from_env().await)),
                    ..Self::default()
                }
            }
            _ => Self::default(),
        }
    }
}

fn missing_client(provider: &str) -> GateError {
    GateError::Config(format!(
        "lock provider '{provider}' is configured but no client was supplied"
    ))
}

/// Select and build the lock implementation for `config`.
pub fn build_lock(config: &LockConfig, clients: &LockClients) -> GateResult<Arc<dyn DistributedLock>> {
    let lock: Arc<dyn DistributedLock> = match config {
        LockConfig::Aws { table } => {
            let client = clients
                .conditional_table
                .clone()
                .ok_or_else(|| missing_client("aws"))?;
            Arc::new(BackendLock::new(
                Arc::new(ConditionalTableBackend::new(client, table.clone())),
                None,
            ))
        }
        LockConfig::Azure { table } => {
            let client = clients
                .entity_table
                .clone()
                .ok_or_else(|| missing_client("azure"))?;
            Arc::new(BackendLock::new(
                Arc::new(EntityTableBackend::new(client, table.clone())),
                None,
            ))
        }
        LockConfig::Gcp { bucket } => {
            let client = clients
                .object_store
                .clone()
                .ok_or_else(|| missing_client("gcp"))?;
            Arc::new(BackendLock::new(
                Arc::new(ObjectStoreBackend::new(client, bucket.clone())),
                None,
            ))
        }
        LockConfig::Disabled => Arc::new(NoOpLock),
    };
    info!(provider = ?config, noop = lock.is_noop(), "lock backend selected");
    Ok(lock)
}
