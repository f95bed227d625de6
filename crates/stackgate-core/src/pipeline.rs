//! Policy-gated, lock-gated execution of jobs.
//!
//! Each command of each job goes through: access policy → project lock →
//! executor. Failures are isolated per project: a failed command stops the
//! rest of its own job and is reported on the PR, other jobs still run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stackgate_state::PlanStorage;
use tracing::{error, info, warn};

use crate::error::{GateError, GateResult};
use crate::executor::{Executor, LockingExecutor};
use crate::jobs::{Command, Job};
use crate::locking::{DistributedLock, ProjectLock};
use crate::policy::{AccessRequest, PolicyChecker};
use crate::vcs::{CommitState, PullRequestService};

/// Terminal state of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Denied by policy, lock held elsewhere, or nothing to do.
    Skipped,
    Succeeded,
    Failed,
}

/// What happened to one command of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub project: String,
    pub command: String,
    pub state: CommandState,
    pub output: String,
    pub error: Option<String>,
}

/// Summary of [`Pipeline::run_jobs`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunJobsOutcome {
    /// No project that attempted an apply ended without a successful apply.
    pub all_applies_success: bool,
    pub at_least_one_apply: bool,
    pub results: Vec<CommandResult>,
}

/// Receives drift reports for projects whose live state diverged.
#[async_trait]
pub trait DriftNotifier: Send + Sync {
    async fn notify_drift(&self, job: &Job, plan_output: &str) -> GateResult<()>;
}

/// Runs jobs in-process against injected collaborators.
pub struct Pipeline {
    pr_service: Arc<dyn PullRequestService>,
    lock: Arc<dyn DistributedLock>,
    policy: Arc<dyn PolicyChecker>,
    executor: Arc<dyn Executor>,
    plan_storage: Option<Arc<dyn PlanStorage>>,
    drift_notifier: Option<Arc<dyn DriftNotifier>>,
}

/// Outcome of a single command before it is labelled with its job.
struct Step {
    state: CommandState,
    output: String,
    error: Option<String>,
}

impl Step {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            state: CommandState::Succeeded,
            output: output.into(),
            error: None,
        }
    }

    fn skipped(output: impl Into<String>) -> Self {
        Self {
            state: CommandState::Skipped,
            output: output.into(),
            error: None,
        }
    }

    fn failed(output: impl Into<String>, err: &GateError) -> Self {
        Self {
            state: CommandState::Failed,
            output: output.into(),
            error: Some(err.to_string()),
        }
    }
}

impl Pipeline {
    pub fn new(
        pr_service: Arc<dyn PullRequestService>,
        lock: Arc<dyn DistributedLock>,
        policy: Arc<dyn PolicyChecker>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            pr_service,
            lock,
            policy,
            executor,
            plan_storage: None,
            drift_notifier: None,
        }
    }

    pub fn with_plan_storage(mut self, storage: Arc<dyn PlanStorage>) -> Self {
        self.plan_storage = Some(storage);
        self
    }

    pub fn with_drift_notifier(mut self, notifier: Arc<dyn DriftNotifier>) -> Self {
        self.drift_notifier = Some(notifier);
        self
    }

    /// Run every command of every job, in order.
    pub async fn run_jobs(&self, jobs: &[Job]) -> RunJobsOutcome {
        let mut applies_per_project: HashMap<String, bool> = HashMap::new();
        let mut results = Vec::new();

        for job in jobs {
            let only_command = job.commands.len() == 1;
            for command in &job.commands {
                let step = self
                    .run_command(job, command, only_command, &mut applies_per_project)
                    .await;
                let failed = step.state == CommandState::Failed;
                results.push(CommandResult {
                    project: job.project_name.clone(),
                    command: command.clone(),
                    state: step.state,
                    output: step.output,
                    error: step.error,
                });
                if failed {
                    warn!(project = %job.project_name, command = %command, "command failed, skipping rest of job");
                    break;
                }
            }
        }

        let outcome = RunJobsOutcome {
            all_applies_success: applies_per_project.values().all(|ok| *ok),
            at_least_one_apply: !applies_per_project.is_empty(),
            results,
        };
        info!(
            jobs = jobs.len(),
            all_applies_success = outcome.all_applies_success,
            at_least_one_apply = outcome.at_least_one_apply,
            "jobs finished"
        );
        outcome
    }

    async fn run_command(
        &self,
        job: &Job,
        command: &str,
        only_command: bool,
        applies: &mut HashMap<String, bool>,
    ) -> Step {
        info!(project = %job.project_name, command, workflow = %job.project_workflow, "running command");

        match self.check_access(job, command, &[]).await {
            Ok(true) => {}
            Ok(false) => {
                applies.insert(job.project_name.clone(), false);
                let msg = format!(
                    "User {} is not allowed to perform action: {}. Check your policies",
                    job.requested_by, command
                );
                self.report(job, &msg).await;
                info!(project = %job.project_name, user = %job.requested_by, command, "denied by access policy");
                if only_command {
                    let err = GateError::PolicyDenied {
                        user: job.requested_by.clone(),
                        action: command.to_string(),
                    };
                    return Step::failed(msg, &err);
                }
                return Step::skipped(msg);
            }
            Err(err) => {
                error!(project = %job.project_name, command, error = %err, "access policy check errored");
                let msg = format!("Error checking policy for {command}. {err}");
                self.report_failure(job, command, &msg).await;
                return Step::failed(msg, &err);
            }
        }

        let Some(parsed) = Command::parse(command) else {
            let msg = format!("Command '{command}' is not supported");
            return Step::failed(msg.clone(), &GateError::Config(msg));
        };

        let result = match parsed {
            Command::Plan => self.plan(job).await,
            Command::Apply => {
                applies.insert(job.project_name.clone(), false);
                let result = self.apply(job).await;
                if matches!(&result, Ok(step) if step.state == CommandState::Succeeded) {
                    applies.insert(job.project_name.clone(), true);
                }
                result
            }
            Command::Destroy => self.destroy(job).await,
            Command::Unlock => self.unlock(job).await,
            Command::Lock => self.lock(job).await,
            Command::DriftDetect => self.drift_detect(job).await,
        };

        match result {
            Ok(step) => step,
            Err(err) => {
                error!(project = %job.project_name, command, error = %err, "command errored");
                let msg = format!("Failed to run {command}. {err}");
                self.report_failure(job, command, &msg).await;
                Step::failed(msg, &err)
            }
        }
    }

    async fn check_access(
        &self,
        job: &Job,
        command: &str,
        plan_policy_violations: &[String],
    ) -> GateResult<bool> {
        let (organisation, repository) = split_namespace(&job.namespace);
        self.policy
            .check_access_policy(&AccessRequest {
                organisation,
                repository,
                project: &job.project_name,
                command,
                pr_number: job.pull_request_number,
                requested_by: &job.requested_by,
                plan_policy_violations,
            })
            .await
    }

    fn project_lock(&self, job: &Job, pr_number: u64) -> ProjectLock {
        ProjectLock::new(
            self.lock.clone(),
            self.pr_service.clone(),
            &job.project_name,
            &job.namespace,
            pr_number,
        )
    }

    fn locking_executor(&self, job: &Job, pr_number: u64) -> LockingExecutor {
        LockingExecutor::new(self.project_lock(job, pr_number), self.executor.clone())
    }

    async fn plan(&self, job: &Job) -> GateResult<Step> {
        let pr = require_pr(job, Command::Plan)?;
        let context = format!("{}/plan", job.project_name);
        self.pr_service
            .set_status(pr, CommitState::Pending, &context)
            .await?;

        let plan = match self.locking_executor(job, pr).plan(job).await {
            Ok(plan) => plan,
            Err(err) => {
                self.pr_service
                    .set_status(pr, CommitState::Failure, &context)
                    .await?;
                self.report(job, &format!("Failed to run digger plan command. {err}"))
                    .await;
                return Ok(Step::failed("plan failed", &err));
            }
        };

        if !plan.performed {
            return Ok(Step::skipped(format!("couldn't lock project {}", job.lock_id())));
        }

        if plan.non_empty {
            self.report(job, &plan_comment(&job.lock_id(), &plan.output)).await;
            let (_, repository) = split_namespace(&job.namespace);
            let verdict = self
                .policy
                .check_plan_policy(repository, &job.project_name, &plan.plan_json)
                .await?;
            if !verdict.passed {
                let mut msg = String::from("Terraform plan failed validation checks");
                for violation in &verdict.violations {
                    msg.push_str("\n    ");
                    msg.push_str(violation);
                }
                self.report(job, &msg).await;
                self.pr_service
                    .set_status(pr, CommitState::Failure, &context)
                    .await?;
                let err = GateError::PolicyDenied {
                    user: job.requested_by.clone(),
                    action: "plan".to_string(),
                };
                return Ok(Step::failed(msg, &err));
            }
            self.report(job, "Terraform plan validation checks succeeded :white_check_mark:")
                .await;
        } else {
            self.report(job, &format!("→ No changes in terraform output for {}", job.lock_id()))
                .await;
        }

        if let Some(storage) = &self.plan_storage {
            let path = job.plan_file_name();
            storage.store_plan(&path, plan.plan_json.as_bytes()).await?;
            info!(project = %job.project_name, path = %path, "plan stored");
        }

        self.pr_service
            .set_status(pr, CommitState::Success, &context)
            .await?;
        Ok(Step::ok(plan.output))
    }

    async fn apply(&self, job: &Job) -> GateResult<Step> {
        let pr = require_pr(job, Command::Apply)?;
        let context = format!("{}/apply", job.project_name);
        self.pr_service
            .set_status(pr, CommitState::Pending, &context)
            .await?;

        if !job.skip_merge_check {
            let merged = self.pr_service.is_merged(pr).await?;
            let mergeable = self.pr_service.is_mergeable(pr).await?;
            info!(pr, merged, mergeable, "apply mergeability");
            if !merged && !mergeable {
                let msg = "cannot perform Apply since the PR is not currently mergeable";
                self.report(job, msg).await;
                self.pr_service
                    .set_status(pr, CommitState::Failure, &context)
                    .await?;
                return Ok(Step::failed(msg, &GateError::Vcs(msg.to_string())));
            }
        }

        let violations = self.stored_plan_violations(job).await?;
        let command = Command::Apply.to_string();
        if !self.check_access(job, &command, &violations).await? {
            let msg = format!(
                "User {} is not allowed to perform action: {}. Check your policies",
                job.requested_by, command
            );
            info!(project = %job.project_name, violations = violations.len(), "apply denied by access policy");
            self.report(job, &msg).await;
            self.pr_service
                .set_status(pr, CommitState::Failure, &context)
                .await?;
            let err = GateError::PolicyDenied {
                user: job.requested_by.clone(),
                action: command,
            };
            return Ok(Step::failed(msg, &err));
        }

        match self.locking_executor(job, pr).apply(job).await {
            Ok(outcome) if outcome.performed => {
                self.pr_service
                    .set_status(pr, CommitState::Success, &context)
                    .await?;
                Ok(Step::ok(outcome.output))
            }
            Ok(outcome) => Ok(Step::skipped(outcome.output)),
            Err(err) => {
                self.pr_service
                    .set_status(pr, CommitState::Failure, &context)
                    .await?;
                self.report(job, &format!("Failed to run digger apply command. {err}"))
                    .await;
                Ok(Step::failed("apply failed", &err))
            }
        }
    }

    /// Plan policy violations of the stored plan, empty without plan storage.
    async fn stored_plan_violations(&self, job: &Job) -> GateResult<Vec<String>> {
        let Some(storage) = &self.plan_storage else {
            info!(project = %job.project_name, "no plan storage, skipping plan policy before apply");
            return Ok(Vec::new());
        };
        let path = job.plan_file_name();
        let stored = storage.retrieve_plan(&path).await?.ok_or_else(|| {
            GateError::Config(format!(
                "no stored plan at {path} for project {}, run digger plan first",
                job.project_name
            ))
        })?;
        let plan_json = String::from_utf8_lossy(&stored);
        let (_, repository) = split_namespace(&job.namespace);
        let verdict = self
            .policy
            .check_plan_policy(repository, &job.project_name, &plan_json)
            .await?;
        Ok(verdict.violations)
    }

    async fn destroy(&self, job: &Job) -> GateResult<Step> {
        let pr = require_pr(job, Command::Destroy)?;
        match self.locking_executor(job, pr).destroy(job).await {
            Ok(true) => Ok(Step::ok("")),
            Ok(false) => Ok(Step::skipped(format!("couldn't lock project {}", job.lock_id()))),
            Err(err) => {
                self.report(job, &format!("failed to run digger destroy command: {err}"))
                    .await;
                Ok(Step::failed("destroy failed", &err))
            }
        }
    }

    /// Force-release the lock and drop the stored plan.
    async fn unlock(&self, job: &Job) -> GateResult<Step> {
        match job.pull_request_number {
            Some(pr) => {
                self.project_lock(job, pr).force_unlock().await?;
            }
            None => {
                self.lock.unlock(&job.lock_id()).await?;
            }
        }

        if let Some(storage) = &self.plan_storage {
            let path = job.plan_file_name();
            if let Err(err) = storage.delete_stored_plan(&path).await {
                warn!(path = %path, error = %err, "failed to delete stored plan");
            }
        }
        Ok(Step::ok(""))
    }

    async fn lock(&self, job: &Job) -> GateResult<Step> {
        let pr = require_pr(job, Command::Lock)?;
        if self.project_lock(job, pr).lock().await? {
            Ok(Step::ok(""))
        } else {
            Ok(Step::skipped(format!("couldn't lock project {}", job.lock_id())))
        }
    }

    /// Plan without locking; notify when the plan has changes.
    async fn drift_detect(&self, job: &Job) -> GateResult<Step> {
        let (organisation, repository) = split_namespace(&job.namespace);
        if !self
            .policy
            .check_drift_policy(organisation, repository, &job.project_name)
            .await?
        {
            info!(project = %job.project_name, "drift detection disabled by policy");
            return Ok(Step::skipped("drift detection not allowed by policy"));
        }

        let plan = match self.executor.plan(job).await {
            Ok(plan) => plan,
            Err(err) => return Ok(Step::failed("drift plan failed", &err)),
        };

        if plan.non_empty {
            info!(project = %job.project_name, "drift detected");
            if let Some(notifier) = &self.drift_notifier {
                if let Err(err) = notifier.notify_drift(job, &plan.output).await {
                    warn!(project = %job.project_name, error = %err, "failed to send drift notification");
                }
            }
        }
        Ok(Step::ok(plan.output))
    }

    /// Publish a PR comment; delivery failures are logged.
    async fn report(&self, job: &Job, body: &str) {
        let Some(pr) = job.pull_request_number else {
            info!(project = %job.project_name, body, "no PR to report to");
            return;
        };
        if let Err(err) = self.pr_service.publish_comment(pr, body).await {
            warn!(pr, error = %err, "failed to publish comment");
        }
    }

    /// Report a failed command and mark its plan/apply status as failed.
    async fn report_failure(&self, job: &Job, command: &str, body: &str) {
        self.report(job, body).await;
        let Some(pr) = job.pull_request_number else {
            return;
        };
        let action = match Command::parse(command) {
            Some(c @ (Command::Plan | Command::Apply)) => c.action(),
            _ => return,
        };
        let context = format!("{}/{action}", job.project_name);
        if let Err(err) = self
            .pr_service
            .set_status(pr, CommitState::Failure, &context)
            .await
        {
            warn!(pr, context = %context, error = %err, "failed to set failure status");
        }
    }
}

fn plan_comment(lock_id: &str, output: &str) -> String {
    format!("<details><summary>Plan for <b>{lock_id}</b></summary>\n\n```terraform\n{output}\n```\n</details>")
}

fn require_pr(job: &Job, command: Command) -> GateResult<u64> {
    job.pull_request_number.ok_or_else(|| {
        GateError::Config(format!(
            "{} for project {} requires a pull request",
            command, job.project_name
        ))
    })
}

/// `myorg/myrepo` → `("myorg", "myrepo")`.
fn split_namespace(namespace: &str) -> (&str, &str) {
    namespace.split_once('/').unwrap_or((namespace, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeExecutor, FakePolicyChecker, FakePullRequestService};
    use crate::locking::{
        BackendLock, ConditionalTableBackend, EntityTableBackend, MemoryConditionalTable,
        MemoryEntityTable,
    };
    use stackgate_state::fakes::MemoryPlanStorage;

    struct Harness {
        prs: Arc<FakePullRequestService>,
        lock: Arc<dyn DistributedLock>,
        policy: Arc<FakePolicyChecker>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                prs: Arc::new(FakePullRequestService::new()),
                lock: Arc::new(BackendLock::new(
                    Arc::new(EntityTableBackend::new(Arc::new(MemoryEntityTable::new()), "DIGGERLOCK")),
                    None,
                )),
                policy: Arc::new(FakePolicyChecker::new()),
            }
        }

        fn pipeline(&self, executor: Arc<FakeExecutor>) -> Pipeline {
            Pipeline::new(self.prs.clone(), self.lock.clone(), self.policy.clone(), executor)
        }
    }

    fn job(project: &str, pr: u64, commands: &[&str]) -> Job {
        Job {
            project_name: project.to_string(),
            project_dir: format!("envs/{project}"),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            pull_request_number: Some(pr),
            event_name: "pull_request".to_string(),
            requested_by: "alice".to_string(),
            namespace: "myorg/myrepo".to_string(),
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn plan_sets_pending_then_success() {
        let h = Harness::new();
        let exec = Arc::new(FakeExecutor::new().with_plan_output("No changes."));
        let outcome = h.pipeline(exec).run_jobs(&[job("dev", 11, &["digger plan"])]).await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].state, CommandState::Succeeded);
        assert_eq!(outcome.results[0].output, "No changes.");
        assert!(!outcome.at_least_one_apply);
        assert_eq!(
            h.prs.statuses_on(11),
            vec![
                ("dev/plan".to_string(), CommitState::Pending),
                ("dev/plan".to_string(), CommitState::Success),
            ]
        );
        assert_eq!(h.lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn access_denial_skips_command_among_several() {
        let h = Harness::new();
        h.policy.deny_command("digger apply");
        let exec = Arc::new(FakeExecutor::new());
        let outcome = h
            .pipeline(exec.clone())
            .run_jobs(&[job("dev", 11, &["digger plan", "digger apply"])])
            .await;

        assert_eq!(outcome.results[0].state, CommandState::Succeeded);
        assert_eq!(outcome.results[1].state, CommandState::Skipped);
        assert!(!outcome.all_applies_success);
        assert!(h
            .prs
            .comments_on(11)
            .iter()
            .any(|c| c == "User alice is not allowed to perform action: digger apply. Check your policies"));
        assert_eq!(exec.calls(), vec!["plan dev"]);
    }

    #[tokio::test]
    async fn access_denial_fails_single_command_job() {
        let h = Harness::new();
        h.policy.deny_user("alice");
        let outcome = h
            .pipeline(Arc::new(FakeExecutor::new()))
            .run_jobs(&[job("dev", 11, &["digger plan"])])
            .await;
        assert_eq!(outcome.results[0].state, CommandState::Failed);
    }

    #[tokio::test]
    async fn plan_is_skipped_when_another_pr_holds_the_lock() {
        let h = Harness::new();
        let exec = Arc::new(FakeExecutor::new());
        let pipeline = h.pipeline(exec.clone());

        pipeline.run_jobs(&[job("dev", 11, &["digger plan"])]).await;
        let outcome = pipeline.run_jobs(&[job("dev", 12, &["digger plan"])]).await;

        assert_eq!(outcome.results[0].state, CommandState::Skipped);
        assert_eq!(exec.calls(), vec!["plan dev"]);
        assert!(h.prs.comments_on(12)[0].contains("locked by another PR #11"));
    }

    #[tokio::test]
    async fn plan_policy_violation_fails_only_the_plan() {
        let h = Harness::new();
        h.policy.fail_plans_with(&["no public buckets"]);
        let exec = Arc::new(FakeExecutor::new().with_changes("{\"resource_changes\":[]}"));
        let outcome = h
            .pipeline(exec)
            .run_jobs(&[job("dev", 11, &["digger plan"]), job("prod", 11, &["digger plan"])])
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.state == CommandState::Failed));
        assert!(h.prs.comments_on(11).iter().any(|c| c.contains("    no public buckets")));
    }

    #[tokio::test]
    async fn apply_requires_mergeable_or_merged() {
        let h = Harness::new();
        h.prs.set_mergeable(11, false);
        let exec = Arc::new(FakeExecutor::new());
        let outcome = h
            .pipeline(exec.clone())
            .run_jobs(&[job("dev", 11, &["digger apply"])])
            .await;

        assert_eq!(outcome.results[0].state, CommandState::Failed);
        assert!(outcome.at_least_one_apply);
        assert!(!outcome.all_applies_success);
        assert!(exec.calls().is_empty());

        h.prs.merge(11);
        let outcome = h.pipeline(exec).run_jobs(&[job("dev", 11, &["digger apply"])]).await;
        assert_eq!(outcome.results[0].state, CommandState::Succeeded);
        assert!(outcome.all_applies_success);
    }

    #[tokio::test]
    async fn executor_failure_is_isolated_to_its_project() {
        let h = Harness::new();
        let exec = Arc::new(FakeExecutor::new().failing_apply());
        let outcome = h
            .pipeline(exec)
            .run_jobs(&[
                job("dev", 11, &["digger apply", "digger unlock"]),
                job("prod", 11, &["digger plan"]),
            ])
            .await;

        let states: Vec<(&str, CommandState)> = outcome
            .results
            .iter()
            .map(|r| (r.project.as_str(), r.state))
            .collect();
        assert_eq!(
            states,
            vec![("dev", CommandState::Failed), ("prod", CommandState::Succeeded)]
        );
        assert!(h.prs.statuses_on(11).contains(&("dev/apply".to_string(), CommitState::Failure)));
    }

    #[tokio::test]
    async fn plan_is_stored_then_dropped_by_unlock() {
        let h = Harness::new();
        let storage = Arc::new(MemoryPlanStorage::new());
        let exec = Arc::new(FakeExecutor::new().with_changes("{\"resource_changes\":[1]}"));
        let pipeline = h.pipeline(exec).with_plan_storage(storage.clone());

        let plan_job = job("dev", 11, &["digger plan"]);
        pipeline.run_jobs(&[plan_job.clone()]).await;
        assert_eq!(h.lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));
        assert_eq!(
            storage.retrieve_plan(&plan_job.plan_file_name()).await.unwrap(),
            Some(b"{\"resource_changes\":[1]}".to_vec())
        );

        let outcome = pipeline.run_jobs(&[job("dev", 11, &["digger unlock"])]).await;
        assert_eq!(outcome.results[0].state, CommandState::Succeeded);
        assert_eq!(h.lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn unlock_from_another_pr_force_releases() {
        let h = Harness::new();
        let pipeline = h.pipeline(Arc::new(FakeExecutor::new()));
        pipeline.run_jobs(&[job("dev", 11, &["digger plan"])]).await;

        let outcome = pipeline.run_jobs(&[job("dev", 12, &["digger unlock"])]).await;
        assert_eq!(outcome.results[0].state, CommandState::Succeeded);
        assert_eq!(h.lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn plan_output_and_validation_result_are_published() {
        let h = Harness::new();
        let exec = Arc::new(
            FakeExecutor::new()
                .with_changes("{\"resource_changes\":[1]}")
                .with_plan_output("Plan: 1 to add"),
        );
        h.pipeline(exec).run_jobs(&[job("dev", 11, &["digger plan"])]).await;

        let comments = h.prs.comments_on(11);
        let plan = comments
            .iter()
            .position(|c| c.contains("Plan for <b>myorg/myrepo#dev</b>") && c.contains("Plan: 1 to add"))
            .unwrap();
        let verdict = comments
            .iter()
            .position(|c| c == "Terraform plan validation checks succeeded :white_check_mark:")
            .unwrap();
        assert!(plan < verdict);
    }

    #[tokio::test]
    async fn empty_plan_publishes_no_changes_notice() {
        let h = Harness::new();
        let exec = Arc::new(FakeExecutor::new().with_plan_output("No changes."));
        h.pipeline(exec).run_jobs(&[job("dev", 11, &["digger plan"])]).await;

        let comments = h.prs.comments_on(11);
        assert!(comments.contains(&"→ No changes in terraform output for myorg/myrepo#dev".to_string()));
        assert!(!comments.iter().any(|c| c.contains("validation checks")));
    }

    #[tokio::test]
    async fn apply_passes_stored_plan_violations_to_access_policy() {
        let h = Harness::new();
        let storage = Arc::new(MemoryPlanStorage::new());
        let exec = Arc::new(FakeExecutor::new().with_changes("{\"resource_changes\":[1]}"));
        let pipeline = h.pipeline(exec.clone()).with_plan_storage(storage);

        pipeline.run_jobs(&[job("dev", 11, &["digger plan"])]).await;
        h.policy.fail_plans_with(&["no public buckets"]);
        let outcome = pipeline.run_jobs(&[job("dev", 11, &["digger apply"])]).await;

        assert_eq!(outcome.results[0].state, CommandState::Failed);
        assert!(!outcome.all_applies_success);
        assert_eq!(exec.calls(), vec!["plan dev"]);
        assert_eq!(
            h.policy.access_checks(),
            vec![
                "alice digger plan dev",
                "alice digger apply dev",
                "alice digger apply dev violations=1",
            ]
        );
        assert!(h.prs.statuses_on(11).contains(&("dev/apply".to_string(), CommitState::Failure)));
    }

    #[tokio::test]
    async fn apply_with_clean_stored_plan_runs() {
        let h = Harness::new();
        let storage = Arc::new(MemoryPlanStorage::new());
        let exec = Arc::new(FakeExecutor::new().with_changes("{\"resource_changes\":[1]}"));
        let pipeline = h.pipeline(exec.clone()).with_plan_storage(storage);

        let outcome = pipeline
            .run_jobs(&[job("dev", 11, &["digger plan", "digger apply"])])
            .await;
        assert!(outcome.results.iter().all(|r| r.state == CommandState::Succeeded));
        assert!(outcome.all_applies_success);
        assert_eq!(exec.calls(), vec!["plan dev", "apply dev"]);
    }

    #[tokio::test]
    async fn apply_without_stored_plan_is_reported() {
        let h = Harness::new();
        let exec = Arc::new(FakeExecutor::new());
        let outcome = h
            .pipeline(exec.clone())
            .with_plan_storage(Arc::new(MemoryPlanStorage::new()))
            .run_jobs(&[job("dev", 11, &["digger apply"])])
            .await;

        assert_eq!(outcome.results[0].state, CommandState::Failed);
        assert!(exec.calls().is_empty());
        assert!(h.prs.comments_on(11).iter().any(|c| c.contains("run digger plan first")));
        assert_eq!(h.prs.statuses_on(11).last(), Some(&("dev/apply".to_string(), CommitState::Failure)));
    }

    #[tokio::test]
    async fn lock_backend_error_is_reported_on_the_pr() {
        let mut h = Harness::new();
        let table = Arc::new(MemoryConditionalTable::new());
        h.lock = Arc::new(BackendLock::new(
            Arc::new(ConditionalTableBackend::new(table.clone(), "DiggerDynamoDBLockTable")),
            None,
        ));
        table.fail_next("connection reset");

        let outcome = h
            .pipeline(Arc::new(FakeExecutor::new()))
            .run_jobs(&[job("dev", 11, &["digger lock"])])
            .await;

        assert_eq!(outcome.results[0].state, CommandState::Failed);
        let comments = h.prs.comments_on(11);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].starts_with("Failed to run digger lock."));
        assert!(comments[0].contains("connection reset"));
    }

    #[tokio::test]
    async fn access_policy_error_fails_the_plan_status() {
        let h = Harness::new();
        h.policy.fail_access_with("policy service unreachable");
        let exec = Arc::new(FakeExecutor::new());
        let outcome = h
            .pipeline(exec.clone())
            .run_jobs(&[job("dev", 11, &["digger plan"])])
            .await;

        assert_eq!(outcome.results[0].state, CommandState::Failed);
        assert!(exec.calls().is_empty());
        assert!(h.prs.comments_on(11)[0].contains("policy service unreachable"));
        assert_eq!(
            h.prs.statuses_on(11),
            vec![("dev/plan".to_string(), CommitState::Failure)]
        );
    }

    #[tokio::test]
    async fn unsupported_command_fails() {
        let h = Harness::new();
        let outcome = h
            .pipeline(Arc::new(FakeExecutor::new()))
            .run_jobs(&[job("dev", 11, &["digger deploy"])])
            .await;
        assert_eq!(outcome.results[0].state, CommandState::Failed);
        assert_eq!(outcome.results[0].output, "Command 'digger deploy' is not supported");
    }

    struct FailingNotifier;

    #[async_trait]
    impl DriftNotifier for FailingNotifier {
        async fn notify_drift(&self, _job: &Job, _plan_output: &str) -> GateResult<()> {
            Err(GateError::Vcs("webhook down".to_string()))
        }
    }

    #[tokio::test]
    async fn drift_notification_failure_is_not_fatal() {
        let h = Harness::new();
        let exec = Arc::new(FakeExecutor::new().with_changes("{}").with_plan_output("1 to change"));
        let outcome = h
            .pipeline(exec)
            .with_drift_notifier(Arc::new(FailingNotifier))
            .run_jobs(&[job("dev", 11, &["digger drift-detect"])])
            .await;
        assert_eq!(outcome.results[0].state, CommandState::Succeeded);
        // Drift detection never takes the project lock.
        assert_eq!(h.lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn drift_policy_can_disable_detection() {
        let h = Harness::new();
        h.policy.deny_drift();
        let exec = Arc::new(FakeExecutor::new());
        let outcome = h
            .pipeline(exec.clone())
            .run_jobs(&[job("dev", 11, &["digger drift-detect"])])
            .await;
        assert_eq!(outcome.results[0].state, CommandState::Skipped);
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn namespace_splits_into_org_and_repo() {
        assert_eq!(split_namespace("myorg/myrepo"), ("myorg", "myrepo"));
        assert_eq!(split_namespace("solo"), ("solo", ""));
    }
}
