//! Typed version-control events.
//!
//! Webhook parsing happens outside the core; it produces one of these
//! variants and the job builder matches on it.

use serde::{Deserialize, Serialize};

pub const EVENT_PULL_REQUEST: &str = "pull_request";
pub const EVENT_ISSUE_COMMENT: &str = "issue_comment";
pub const EVENT_PUSH: &str = "push";
pub const EVENT_MERGE_GROUP: &str = "merge_group";

/// Pull request action that triggered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    ConvertedToDraft,
    ReadyForReview,
    Edited,
}

/// Repository a change belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// `owner/name`, used as the lock namespace.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    pub number: u64,
    pub repository: Repository,
    pub sender: String,
    pub head_branch: String,
    pub base_branch: String,
    pub head_sha: String,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCommentEvent {
    pub number: u64,
    pub repository: Repository,
    pub sender: String,
    pub body: String,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub head_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub repository: Repository,
    pub sender: String,
    /// Branch name without `refs/heads/`.
    pub branch: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeGroupEvent {
    pub repository: Repository,
    pub sender: String,
    pub head_branch: String,
    pub head_sha: String,
    pub base_branch: String,
}

/// Closed set of events the builder understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VcsEvent {
    PullRequest(PullRequestEvent),
    IssueComment(IssueCommentEvent),
    Push(PushEvent),
    MergeGroup(MergeGroupEvent),
}

impl VcsEvent {
    /// Event name recorded on jobs.
    pub fn name(&self) -> &'static str {
        match self {
            VcsEvent::PullRequest(_) => EVENT_PULL_REQUEST,
            VcsEvent::IssueComment(_) => EVENT_ISSUE_COMMENT,
            VcsEvent::Push(_) => EVENT_PUSH,
            VcsEvent::MergeGroup(_) => EVENT_MERGE_GROUP,
        }
    }

    pub fn repository(&self) -> &Repository {
        match self {
            VcsEvent::PullRequest(e) => &e.repository,
            VcsEvent::IssueComment(e) => &e.repository,
            VcsEvent::Push(e) => &e.repository,
            VcsEvent::MergeGroup(e) => &e.repository,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            VcsEvent::PullRequest(e) => &e.sender,
            VcsEvent::IssueComment(e) => &e.sender,
            VcsEvent::Push(e) => &e.sender,
            VcsEvent::MergeGroup(e) => &e.sender,
        }
    }

    /// PR number, for events scoped to one.
    pub fn pr_number(&self) -> Option<u64> {
        match self {
            VcsEvent::PullRequest(e) => Some(e.number),
            VcsEvent::IssueComment(e) => Some(e.number),
            VcsEvent::Push(_) | VcsEvent::MergeGroup(_) => None,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
