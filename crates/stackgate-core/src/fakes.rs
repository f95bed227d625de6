//! In-memory collaborators for tests and dry runs.
//!
//! Provides `FakePullRequestService`, `FakePolicyChecker`, `FakeExecutor`
//! and `RecordingTrigger`. None of them touch the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{GateError, GateResult};
use crate::executor::{ApplyOutcome, Executor, PlanOutcome};
use crate::jobs::{Job, JobSpec};
use crate::policy::{AccessRequest, PlanPolicyOutcome, PolicyChecker};
use crate::scheduler::CiTrigger;
use crate::vcs::{Comment, CommitState, PullRequestService};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// FakePullRequestService
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct PullRequestState {
    changed_files: Vec<String>,
    closed: bool,
    merged: bool,
    mergeable: bool,
    comments: Vec<Comment>,
    statuses: Vec<(String, CommitState)>,
}

/// PR state kept in memory. Every PR starts open, unmerged and mergeable.
#[derive(Debug, Default)]
pub struct FakePullRequestService {
    prs: Mutex<HashMap<u64, PullRequestState>>,
    next_comment_id: AtomicU64,
}

impl FakePullRequestService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_pr<R>(&self, pr: u64, f: impl FnOnce(&mut PullRequestState) -> R) -> R {
        let mut prs = guard(&self.prs);
        let state = prs.entry(pr).or_insert_with(|| PullRequestState {
            mergeable: true,
            ..PullRequestState::default()
        });
        f(state)
    }

    pub fn set_changed_files(&self, pr: u64, files: &[&str]) {
        self.with_pr(pr, |s| {
            s.changed_files = files.iter().map(|f| f.to_string()).collect()
        });
    }

    pub fn close(&self, pr: u64) {
        self.with_pr(pr, |s| s.closed = true);
    }

    pub fn merge(&self, pr: u64) {
        self.with_pr(pr, |s| {
            s.merged = true;
            s.closed = true;
        });
    }

    pub fn set_mergeable(&self, pr: u64, mergeable: bool) {
        self.with_pr(pr, |s| s.mergeable = mergeable);
    }

    /// Comment bodies on `pr`, oldest first.
    pub fn comments_on(&self, pr: u64) -> Vec<String> {
        self.with_pr(pr, |s| s.comments.iter().map(|c| c.body.clone()).collect())
    }

    /// `(context, state)` pairs in the order they were set.
    pub fn statuses_on(&self, pr: u64) -> Vec<(String, CommitState)> {
        self.with_pr(pr, |s| s.statuses.clone())
    }
}

#[async_trait]
impl PullRequestService for FakePullRequestService {
    async fn get_changed_files(&self, pr_number: u64) -> GateResult<Vec<String>> {
        Ok(self.with_pr(pr_number, |s| s.changed_files.clone()))
    }

    async fn set_status(
        &self,
        pr_number: u64,
        state: CommitState,
        context: &str,
    ) -> GateResult<()> {
        self.with_pr(pr_number, |s| s.statuses.push((context.to_string(), state)));
        Ok(())
    }

    async fn is_mergeable(&self, pr_number: u64) -> GateResult<bool> {
        Ok(self.with_pr(pr_number, |s| s.mergeable))
    }

    async fn is_merged(&self, pr_number: u64) -> GateResult<bool> {
        Ok(self.with_pr(pr_number, |s| s.merged))
    }

    async fn is_closed(&self, pr_number: u64) -> GateResult<bool> {
        Ok(self.with_pr(pr_number, |s| s.closed))
    }

    async fn publish_comment(&self, pr_number: u64, body: &str) -> GateResult<Comment> {
        let comment = Comment {
            id: self.next_comment_id.fetch_add(1, Ordering::SeqCst) + 1,
            body: body.to_string(),
        };
        self.with_pr(pr_number, |s| s.comments.push(comment.clone()));
        Ok(comment)
    }

    async fn edit_comment(&self, pr_number: u64, comment_id: u64, body: &str) -> GateResult<()> {
        self.with_pr(pr_number, |s| {
            match s.comments.iter_mut().find(|c| c.id == comment_id) {
                Some(c) => {
                    c.body = body.to_string();
                    Ok(())
                }
                None => Err(GateError::Vcs(format!(
                    "comment {comment_id} not found on PR #{pr_number}"
                ))),
            }
        })
    }

    async fn get_comments(&self, pr_number: u64) -> GateResult<Vec<Comment>> {
        Ok(self.with_pr(pr_number, |s| s.comments.clone()))
    }
}

// ---------------------------------------------------------------------------
// FakePolicyChecker
// ---------------------------------------------------------------------------

/// Allows everything unless told otherwise.
#[derive(Debug, Default)]
pub struct FakePolicyChecker {
    denied_users: Mutex<HashSet<String>>,
    denied_commands: Mutex<HashSet<String>>,
    plan_violations: Mutex<Vec<String>>,
    drift_denied: AtomicBool,
    access_error: Mutex<Option<String>>,
    access_checks: Mutex<Vec<String>>,
}

impl FakePolicyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user(&self, user: &str) {
        guard(&self.denied_users).insert(user.to_string());
    }

    pub fn deny_command(&self, command: &str) {
        guard(&self.denied_commands).insert(command.to_string());
    }

    /// Every plan check fails with these violations.
    pub fn fail_plans_with(&self, violations: &[&str]) {
        *guard(&self.plan_violations) = violations.iter().map(|v| v.to_string()).collect();
    }

    /// Every access check errors with this message.
    pub fn fail_access_with(&self, message: &str) {
        *guard(&self.access_error) = Some(message.to_string());
    }

    pub fn deny_drift(&self) {
        self.drift_denied.store(true, Ordering::SeqCst);
    }

    /// `"{user} {command} {project}"` for each access check, in order,
    /// suffixed with ` violations={n}` when plan violations were passed.
    pub fn access_checks(&self) -> Vec<String> {
        guard(&self.access_checks).clone()
    }
}

#[async_trait]
impl PolicyChecker for FakePolicyChecker {
    async fn check_access_policy(&self, request: &AccessRequest<'_>) -> GateResult<bool> {
        let mut entry = format!(
            "{} {} {}",
            request.requested_by, request.command, request.project
        );
        if !request.plan_policy_violations.is_empty() {
            entry.push_str(&format!(" violations={}", request.plan_policy_violations.len()));
        }
        guard(&self.access_checks).push(entry);
        if let Some(message) = guard(&self.access_error).clone() {
            return Err(GateError::Policy(message));
        }
        let denied = guard(&self.denied_users).contains(request.requested_by)
            || guard(&self.denied_commands).contains(request.command)
            || !request.plan_policy_violations.is_empty();
        Ok(!denied)
    }

    async fn check_plan_policy(
        &self,
        _repository: &str,
        _project: &str,
        _plan_json: &str,
    ) -> GateResult<PlanPolicyOutcome> {
        let violations = guard(&self.plan_violations).clone();
        if violations.is_empty() {
            Ok(PlanPolicyOutcome::pass())
        } else {
            Ok(PlanPolicyOutcome::fail(violations))
        }
    }

    async fn check_drift_policy(
        &self,
        _organisation: &str,
        _repository: &str,
        _project: &str,
    ) -> GateResult<bool> {
        Ok(!self.drift_denied.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// FakeExecutor
// ---------------------------------------------------------------------------

/// Scripted executor that records `"{command} {project}"` per call.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    plan_output: String,
    plan_json: Option<String>,
    fail_plan: bool,
    fail_apply: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan_output(mut self, output: &str) -> Self {
        self.plan_output = output.to_string();
        self
    }

    /// Plans report changes with this JSON.
    pub fn with_changes(mut self, plan_json: &str) -> Self {
        self.plan_json = Some(plan_json.to_string());
        self
    }

    pub fn failing_plan(mut self) -> Self {
        self.fail_plan = true;
        self
    }

    pub fn failing_apply(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    fn record(&self, command: &str, job: &Job) {
        guard(&self.calls).push(format!("{command} {}", job.project_name));
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn plan(&self, job: &Job) -> GateResult<PlanOutcome> {
        self.record("plan", job);
        if self.fail_plan {
            return Err(GateError::executor("plan", &job.project_name, "exit status 1"));
        }
        Ok(PlanOutcome {
            performed: true,
            non_empty: self.plan_json.is_some(),
            output: self.plan_output.clone(),
            plan_json: self.plan_json.clone().unwrap_or_default(),
        })
    }

    async fn apply(&self, job: &Job) -> GateResult<ApplyOutcome> {
        self.record("apply", job);
        if self.fail_apply {
            return Err(GateError::executor("apply", &job.project_name, "exit status 1"));
        }
        Ok(ApplyOutcome {
            performed: true,
            output: "Apply complete!".to_string(),
        })
    }

    async fn destroy(&self, job: &Job) -> GateResult<bool> {
        self.record("destroy", job);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// RecordingTrigger
// ---------------------------------------------------------------------------

/// Records dispatched specs instead of calling a CI provider.
#[derive(Debug, Default)]
pub struct RecordingTrigger {
    dispatched: Mutex<Vec<JobSpec>>,
    fail_next: AtomicBool,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> Vec<JobSpec> {
        guard(&self.dispatched).clone()
    }

    pub fn dispatched_projects(&self) -> Vec<String> {
        guard(&self.dispatched)
            .iter()
            .map(|s| s.job.project_name.clone())
            .collect()
    }
}

#[async_trait]
impl CiTrigger for RecordingTrigger {
    async fn trigger_workflow(&self, spec: &JobSpec, _vcs_token: &str) -> GateResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(GateError::Trigger("dispatch rejected".to_string()));
        }
        guard(&self.dispatched).push(spec.clone());
        Ok(())
    }
}
