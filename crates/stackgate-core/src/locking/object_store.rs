//! Object storage backend.
//!
//! The object name is the resource. Ownership lives in object metadata:
//! `LockId` (owner) and `CreatedAt` (RFC3339). Acquire is a
//! create-if-absent upload, so two writers cannot both succeed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use tracing::{debug, warn};

use super::LockBackend;
use crate::error::{GateError, GateResult};

const LOCK_ID_KEY: &str = "LockId";
const CREATED_AT_KEY: &str = "CreatedAt";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockObject {
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Precondition failed: the object already exists.
    Exists,
}

/// The subset of an object-store API the backend needs.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Upload an empty object only if no object with this name exists.
    async fn create_if_absent(
        &self,
        bucket: &str,
        name: &str,
        object: LockObject,
    ) -> GateResult<CreateOutcome>;

    /// `None` when the object does not exist.
    async fn stat(&self, bucket: &str, name: &str) -> GateResult<Option<LockObject>>;

    async fn delete(&self, bucket: &str, name: &str) -> GateResult<()>;
}

pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectStoreClient>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl LockBackend for ObjectStoreBackend {
    async fn acquire(&self, resource: &str, owner: u64, ttl: Option<Duration>) -> GateResult<bool> {
        if ttl.is_some() {
            warn!(resource, "object store locks have no TTL, ignoring");
        }
        let object = LockObject {
            metadata: HashMap::from([
                (LOCK_ID_KEY.to_string(), owner.to_string()),
                (
                    CREATED_AT_KEY.to_string(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
            ]),
        };
        let outcome = self
            .client
            .create_if_absent(&self.bucket, resource, object)
            .await?;
        Ok(outcome == CreateOutcome::Created)
    }

    /// `Ok(false)` when there was nothing to release.
    async fn release(&self, resource: &str) -> GateResult<bool> {
        let Some(owner) = self.read(resource).await? else {
            debug!(resource, "no lock to release");
            return Ok(false);
        };
        self.client.delete(&self.bucket, resource).await?;
        debug!(resource, owner, "lock object deleted");
        Ok(true)
    }

    async fn read(&self, resource: &str) -> GateResult<Option<u64>> {
        let Some(object) = self.client.stat(&self.bucket, resource).await? else {
            return Ok(None);
        };
        let raw = object.metadata.get(LOCK_ID_KEY).map(String::as_str).unwrap_or("");
        raw.parse::<u64>().map(Some).map_err(|_| {
            GateError::LockBackend(format!(
                "object {resource} has unparseable {LOCK_ID_KEY} {raw:?}"
            ))
        })
    }

    fn name(&self) -> &'static str {
        "object-store"
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

/// In-memory [`ObjectStoreClient`] keyed by `(bucket, name)`.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), LockObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<LockObject> {
        self.guard()
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<(String, String), LockObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn create_if_absent(
        &self,
        bucket: &str,
        name: &str,
        object: LockObject,
    ) -> GateResult<CreateOutcome> {
        let mut objects = self.guard();
        let key = (bucket.to_string(), name.to_string());
        if objects.contains_key(&key) {
            return Ok(CreateOutcome::Exists);
        }
        objects.insert(key, object);
        Ok(CreateOutcome::Created)
    }

    async fn stat(&self, bucket: &str, name: &str) -> GateResult<Option<LockObject>> {
        Ok(self.object(bucket, name))
    }

    async fn delete(&self, bucket: &str, name: &str) -> GateResult<()> {
        self.guard().remove(&(bucket.to_string(), name.to_string()));
        Ok(())
    }
}
