//! Filesystem-backed plan storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::store::{PlanStorage, StorageResult};

/// Stores each plan as a file under `root`. Plan paths are flat file names;
/// any `/` is rejected so a plan cannot escape the root directory.
#[derive(Debug, Clone)]
pub struct FsPlanStorage {
    root: PathBuf,
}

impl FsPlanStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        if path.is_empty() || path.contains('/') || path.contains('\\') || path == ".." {
            return Err(StorageError::Backend(format!("invalid plan path: {path:?}")));
        }
        Ok(self.root.join(path))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl PlanStorage for FsPlanStorage {
    async fn store_plan(&self, path: &str, plan: &[u8]) -> StorageResult<()> {
        let file = self.resolve(path)?;
        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;
        tokio::fs::write(&file, plan).await.map_err(io_err)?;
        debug!(path, bytes = plan.len(), "stored plan");
        Ok(())
    }

    async fn retrieve_plan(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn delete_stored_plan(&self, path: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn plan_exists(&self, path: &str) -> StorageResult<bool> {
        tokio::fs::try_exists(self.resolve(path)?)
            .await
            .map_err(io_err)
    }
}
