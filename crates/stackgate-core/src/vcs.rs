//! Version-control collaborator contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateResult;

/// Commit status state shown next to a check context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

/// Pull/merge request operations on the hosting service.
///
/// Inject a real implementation that calls the provider API, or
/// [`crate::fakes::FakePullRequestService`] for tests.
#[async_trait]
pub trait PullRequestService: Send + Sync {
    async fn get_changed_files(&self, pr_number: u64) -> GateResult<Vec<String>>;

    /// Set a commit status, e.g. `("dev/plan", Pending)`.
    async fn set_status(&self, pr_number: u64, state: CommitState, context: &str)
        -> GateResult<()>;

    async fn is_mergeable(&self, pr_number: u64) -> GateResult<bool>;

    async fn is_merged(&self, pr_number: u64) -> GateResult<bool>;

    async fn is_closed(&self, pr_number: u64) -> GateResult<bool>;

    async fn publish_comment(&self, pr_number: u64, body: &str) -> GateResult<Comment>;

    async fn edit_comment(&self, pr_number: u64, comment_id: u64, body: &str) -> GateResult<()>;

    async fn get_comments(&self, pr_number: u64) -> GateResult<Vec<Comment>>;
}
