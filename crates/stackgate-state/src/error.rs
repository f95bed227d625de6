//! Error types for stackgate-state

use thiserror::Error;

/// Errors returned by the store traits and their implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Query or transport failure inside the backend
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A record with the given id does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Compare-and-set lost against another writer
    #[error("run {run_id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    /// A persisted status string did not match any known variant
    #[error("unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },
}

impl StorageError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_names_both_versions() {
        let err = StorageError::VersionConflict {
            run_id: "run-1".to_string(),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("run-1"));
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 4"));
    }

    #[test]
    fn not_found_includes_kind() {
        let err = StorageError::not_found("batch", "b-42");
        assert_eq!(err.to_string(), "batch not found: b-42");
    }
}
