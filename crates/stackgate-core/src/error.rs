//! Structured errors for the orchestration core.
//!
//! Every [`GateError`] maps to an [`ErrorKind`] so callers can decide
//! whether to skip a command, abort an event, or retry later without
//! inspecting message text.

use stackgate_state::StorageError;
use thiserror::Error;

/// Category of a [`GateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lock held elsewhere or a policy denial. Skip the command, keep going.
    Contention,
    /// Bad workflow, project or graph configuration. Abort the event.
    Config,
    /// Backend, VCS or network failure. Surface to the caller.
    Transient,
    /// Plan/apply/destroy returned a failure.
    ExecutorFailure,
}

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum GateError {
    /// A project's `depends_on` names a project that is not configured.
    #[error("project '{project}' does not exist")]
    UnknownProject { project: String },

    /// Dependency declarations form a cycle.
    #[error("dependency cycle detected involving projects: {projects:?}")]
    DependencyCycle { projects: Vec<String> },

    /// A project references a workflow that is not configured.
    #[error("failed to find workflow config '{workflow}' for project '{project}'")]
    UnknownWorkflow { workflow: String, project: String },

    /// A comment asked for a project outside the change's impacted set.
    #[error("requested project {project} is not impacted by this PR")]
    ProjectNotImpacted { project: String },

    /// A comment command could not be parsed.
    #[error("invalid command '{comment}': {reason}")]
    InvalidCommand { comment: String, reason: String },

    /// Any other configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// The project lock is held by another change request.
    #[error("resource {resource} is locked by #{owner}")]
    Locked { resource: String, owner: u64 },

    /// The policy checker refused the action.
    #[error("user {user} is not allowed to perform action: {action}")]
    PolicyDenied { user: String, action: String },

    /// Lock backend transport failure.
    #[error("lock backend error: {0}")]
    LockBackend(String),

    /// VCS API failure.
    #[error("vcs error: {0}")]
    Vcs(String),

    /// Policy service failure (not a denial).
    #[error("policy check failed: {0}")]
    Policy(String),

    /// CI dispatch failure.
    #[error("ci trigger failed: {0}")]
    Trigger(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Plan, apply or destroy failed.
    #[error("{command} failed for project {project}: {reason}")]
    Executor {
        command: String,
        project: String,
        reason: String,
    },
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::UnknownProject { .. }
            | GateError::DependencyCycle { .. }
            | GateError::UnknownWorkflow { .. }
            | GateError::ProjectNotImpacted { .. }
            | GateError::InvalidCommand { .. }
            | GateError::Config(_) => ErrorKind::Config,
            GateError::Locked { .. } | GateError::PolicyDenied { .. } => ErrorKind::Contention,
            GateError::LockBackend(_)
            | GateError::Vcs(_)
            | GateError::Policy(_)
            | GateError::Trigger(_)
            | GateError::Storage(_)
            | GateError::Serialization(_) => ErrorKind::Transient,
            GateError::Executor { .. } => ErrorKind::ExecutorFailure,
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Config
    }

    pub(crate) fn executor(
        command: impl Into<String>,
        project: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        GateError::Executor {
            command: command.into(),
            project: project.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience result alias.
pub type GateResult<T> = std::result::Result<T, GateError>;
