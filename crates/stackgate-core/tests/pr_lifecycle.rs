//! PR lifecycle through the public API: changed files → jobs → pipeline,
//! with a shared lock table between two PRs.

use std::sync::Arc;

use stackgate_core::events::{IssueCommentEvent, PullRequestEvent};
use stackgate_core::fakes::{FakeExecutor, FakePolicyChecker, FakePullRequestService};
use stackgate_core::locking::MemoryConditionalTable;
use stackgate_core::{
    build_lock, impacted_projects, CommandState, DistributedLock, GateConfig, JobBuilder,
    LockClients, Pipeline, ProjectGraph, PullRequestAction, PullRequestService, Repository,
    VcsEvent,
};

const CONFIG: &str = r#"{
    "projects": [
        {"name": "network", "dir": "envs/network"},
        {"name": "dev", "dir": "envs/dev", "depends_on": ["network"]},
        {"name": "prod", "dir": "envs/prod"}
    ],
    "workflows": {
        "default": {
            "plan": {"steps": [{"action": "init"}, {"action": "plan"}]},
            "apply": {"steps": [{"action": "init"}, {"action": "apply"}]},
            "configuration": {
                "on_pull_request_pushed": ["digger plan"],
                "on_pull_request_closed": ["digger unlock"],
                "on_commit_to_default": ["digger apply"]
            }
        }
    },
    "lock": {"provider": "aws"}
}"#;

fn pr(action: PullRequestAction, number: u64, merged: bool) -> VcsEvent {
    VcsEvent::PullRequest(PullRequestEvent {
        action,
        number,
        repository: Repository::new("myorg", "myrepo"),
        sender: "alice".to_string(),
        head_branch: format!("feature-{number}"),
        base_branch: "main".to_string(),
        head_sha: "abc123".to_string(),
        merged,
        draft: false,
    })
}

fn comment(number: u64, body: &str) -> VcsEvent {
    VcsEvent::IssueComment(IssueCommentEvent {
        number,
        repository: Repository::new("myorg", "myrepo"),
        sender: "bob".to_string(),
        body: body.to_string(),
        head_branch: format!("feature-{number}"),
        head_sha: "abc123".to_string(),
    })
}

struct World {
    config: GateConfig,
    graph: ProjectGraph,
    prs: Arc<FakePullRequestService>,
    lock: Arc<dyn DistributedLock>,
    executor: Arc<FakeExecutor>,
}

impl World {
    fn new() -> Self {
        let config = GateConfig::from_json(CONFIG).unwrap();
        let graph = ProjectGraph::from_projects(&config.projects).unwrap();
        let clients = LockClients {
            conditional_table: Some(Arc::new(MemoryConditionalTable::new())),
            ..LockClients::default()
        };
        let lock = build_lock(&config.lock, &clients).unwrap();
        Self {
            config,
            graph,
            prs: Arc::new(FakePullRequestService::new()),
            lock,
            executor: Arc::new(FakeExecutor::new().with_plan_output("Plan: 1 to add")),
        }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.prs.clone(),
            self.lock.clone(),
            Arc::new(FakePolicyChecker::new()),
            self.executor.clone(),
        )
    }

    async fn jobs_for(&self, event: &VcsEvent, pr_number: u64) -> stackgate_core::BuiltJobs {
        let changed = self.prs.get_changed_files(pr_number).await.unwrap();
        let impacted = impacted_projects(&self.config, &self.graph, &changed).unwrap();
        JobBuilder::new(&self.config, &self.graph)
            .with_env_lookup(|_| None)
            .build(event, &impacted)
            .unwrap()
    }
}

#[tokio::test]
async fn opened_pr_plans_and_locks_impacted_project() {
    let world = World::new();
    world.prs.set_changed_files(11, &["envs/dev/main.tf"]);

    let built = world.jobs_for(&pr(PullRequestAction::Opened, 11, false), 11).await;
    assert_eq!(built.jobs.len(), 1);
    assert_eq!(built.jobs[0].project_name, "dev");
    assert_eq!(built.jobs[0].commands, vec!["digger plan"]);
    assert_eq!(built.jobs[0].pull_request_number, Some(11));

    let outcome = world.pipeline().run_jobs(&built.jobs).await;
    assert_eq!(outcome.results[0].state, CommandState::Succeeded);
    assert_eq!(world.lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));
    assert!(world.prs.comments_on(11)[0].contains("has been locked by PR #11"));
}

#[tokio::test]
async fn second_pr_waits_until_first_unlocks() {
    let world = World::new();
    world.prs.set_changed_files(11, &["envs/dev/main.tf"]);
    world.prs.set_changed_files(12, &["envs/dev/variables.tf"]);
    let pipeline = world.pipeline();

    let first = world.jobs_for(&pr(PullRequestAction::Opened, 11, false), 11).await;
    pipeline.run_jobs(&first.jobs).await;

    let second = world.jobs_for(&pr(PullRequestAction::Opened, 12, false), 12).await;
    let outcome = pipeline.run_jobs(&second.jobs).await;
    assert_eq!(outcome.results[0].state, CommandState::Skipped);
    assert_eq!(world.lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));

    let unlock = world.jobs_for(&comment(11, "digger unlock"), 11).await;
    pipeline.run_jobs(&unlock.jobs).await;
    assert_eq!(world.lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);

    let retry = world.jobs_for(&comment(12, "DiGGeR PlAn"), 12).await;
    assert_eq!(retry.jobs[0].commands, vec!["digger plan"]);
    let outcome = pipeline.run_jobs(&retry.jobs).await;
    assert_eq!(outcome.results[0].state, CommandState::Succeeded);
    assert_eq!(world.lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(12));
}

#[tokio::test]
async fn merged_pr_applies_with_commit_to_default_commands() {
    let world = World::new();
    world.prs.set_changed_files(11, &["envs/dev/main.tf"]);
    let pipeline = world.pipeline();

    let plan = world.jobs_for(&pr(PullRequestAction::Opened, 11, false), 11).await;
    pipeline.run_jobs(&plan.jobs).await;

    world.prs.merge(11);
    let merged = world.jobs_for(&pr(PullRequestAction::Closed, 11, true), 11).await;
    assert_eq!(merged.jobs[0].commands, vec!["digger apply"]);

    let outcome = pipeline.run_jobs(&merged.jobs).await;
    assert!(outcome.at_least_one_apply);
    assert!(outcome.all_applies_success);
    assert_eq!(world.executor.calls(), vec!["plan dev", "apply dev"]);
}

#[tokio::test]
async fn abandoned_lock_is_recovered_when_owner_pr_closes() {
    let world = World::new();
    world.prs.set_changed_files(11, &["envs/prod/main.tf"]);
    world.prs.set_changed_files(12, &["envs/prod/main.tf"]);
    let pipeline = world.pipeline();

    let first = world.jobs_for(&pr(PullRequestAction::Opened, 11, false), 11).await;
    pipeline.run_jobs(&first.jobs).await;
    world.prs.close(11);

    let second = world.jobs_for(&pr(PullRequestAction::Synchronize, 12, false), 12).await;
    let outcome = pipeline.run_jobs(&second.jobs).await;
    assert_eq!(outcome.results[0].state, CommandState::Succeeded);
    assert_eq!(world.lock.get_lock("myorg/myrepo#prod").await.unwrap(), Some(12));
}

#[tokio::test]
async fn hard_dependency_mode_plans_dependents_after_their_dependencies() {
    let mut world = World::new();
    world.config.dependency_mode = stackgate_core::DependencyMode::Hard;
    world.prs.set_changed_files(11, &["envs/network/vpc.tf"]);

    let built = world.jobs_for(&pr(PullRequestAction::Opened, 11, false), 11).await;
    let order: Vec<&str> = built.jobs.iter().map(|j| j.project_name.as_str()).collect();
    assert_eq!(order, vec!["network", "dev"]);
}
