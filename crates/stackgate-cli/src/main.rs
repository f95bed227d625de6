//! Stackgate CLI
//!
//! The `stackgate` command turns VCS events into IaC jobs and drives the
//! per-project run queue.
//!
//! ## Commands
//!
//! - `jobs`: Build the ordered job list for an event and its changed files
//! - `order`: Print the project dependency order
//! - `process-queue`: Poll the run queue and dispatch plan/apply stages
//! - `approve`: Approve a run waiting for approval
//! - `lock`: Show, acquire or release a project lock

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use stackgate_core::{
    build_lock, impacted_projects, CiTrigger, DistributedLock, GateConfig, GithubActionsConfig,
    GithubActionsTrigger, JobBuilder, LockClients, ProjectGraph, RunQueueProcessor, Scheduler,
    TickReport, VcsEvent,
};
use stackgate_state::{RunId, SurrealStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "stackgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lock-aware orchestration of Terraform/OpenTofu runs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "STACKGATE_LOG_JSON")]
    json: bool,

    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "STACKGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the jobs an event produces, upstream projects first
    Jobs {
        /// Event file (JSON, tagged by `kind`)
        #[arg(short, long)]
        event: PathBuf,

        /// Changed file path (repeatable)
        #[arg(long = "changed-file")]
        changed_files: Vec<String>,

        /// File listing changed paths, one per line
        #[arg(long)]
        changed_files_from: Option<PathBuf>,
    },

    /// Print projects in dependency order
    Order,

    /// Poll the run queue, triggering plan and apply stages
    ProcessQueue {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        github: GithubArgs,

        /// Seconds between ticks
        #[arg(long, default_value = "10")]
        interval_secs: u64,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Approve a run that is waiting for approval
    Approve {
        /// Run ID
        run_id: String,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Inspect or change a project lock using the configured provider
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Print the PR holding a resource
    Show {
        /// Lock resource, `owner/repo#project`
        resource: String,
    },

    /// Take the lock on behalf of a PR
    Acquire {
        resource: String,

        /// PR number recorded as the owner
        #[arg(long)]
        pr: u64,
    },

    /// Release the lock whoever holds it
    Release { resource: String },
}

#[derive(Args)]
struct StoreArgs {
    /// SurrealDB endpoint (`mem://`, `ws://host:port`, ...)
    #[arg(long, env = "STACKGATE_DB", default_value = "mem://")]
    db: String,

    /// SurrealDB namespace
    #[arg(long, env = "STACKGATE_DB_NS", default_value = "stackgate")]
    db_namespace: String,

    /// SurrealDB database
    #[arg(long, env = "STACKGATE_DB_NAME", default_value = "main")]
    db_name: String,
}

impl StoreArgs {
    async fn connect(&self) -> Result<Arc<SurrealStore>> {
        let store = SurrealStore::connect(&self.db, &self.db_namespace, &self.db_name)
            .await
            .with_context(|| format!("Failed to connect to run store at {}", self.db))?;
        Ok(Arc::new(store))
    }
}

#[derive(Args)]
struct GithubArgs {
    /// Repository that hosts the CI workflow, as `owner/name`
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repository: String,

    /// Workflow file dispatched for each job
    #[arg(long, default_value = "digger_workflow.yml")]
    workflow_file: String,

    /// Branch or tag the workflow runs on
    #[arg(long = "ref", default_value = "main")]
    git_ref: String,

    /// Token used for the dispatch API and passed on to jobs
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// GitHub API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = stackgate_core::github::DEFAULT_API_BASE)]
    api_base: String,
}

impl GithubArgs {
    fn trigger(&self) -> Result<GithubActionsTrigger> {
        let (owner, repo) = self
            .repository
            .split_once('/')
            .with_context(|| format!("repository '{}' is not owner/name", self.repository))?;
        let config = GithubActionsConfig::new(owner, repo, &self.workflow_file, &self.git_ref)
            .with_api_base(&self.api_base);
        Ok(GithubActionsTrigger::new(config)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stackgate_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Jobs {
            event,
            changed_files,
            changed_files_from,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let mut changed = changed_files;
            if let Some(path) = changed_files_from {
                changed.extend(read_changed_files(&path)?);
            }
            let output = cmd_jobs(&config, &event, &changed)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Order => {
            let config = load_config(cli.config.as_deref())?;
            for name in cmd_order(&config)? {
                println!("{name}");
            }
            Ok(())
        }
        Commands::ProcessQueue {
            store,
            github,
            interval_secs,
            once,
        } => {
            let max_concurrency = match cli.config.as_deref() {
                Some(path) => load_config(Some(path))?.max_concurrency_per_batch,
                None => 0,
            };
            let store = store.connect().await?;
            let trigger: Arc<dyn CiTrigger> = Arc::new(github.trigger()?);
            let scheduler = Arc::new(Scheduler::new(
                store.clone(),
                trigger,
                max_concurrency,
                github.token.clone(),
            ));
            let processor = RunQueueProcessor::new(store, scheduler);
            cmd_process_queue(&processor, Duration::from_secs(interval_secs), once).await
        }
        Commands::Approve { run_id, store } => {
            let store = store.connect().await?;
            // Approval never dispatches, so the scheduler gets a trigger
            // that refuses to run.
            let scheduler = Arc::new(Scheduler::new(
                store.clone(),
                Arc::new(NoDispatch),
                0,
                "",
            ));
            let processor = RunQueueProcessor::new(store, scheduler);
            cmd_approve(&processor, &run_id).await
        }
        Commands::Lock { action } => {
            let config = load_config(cli.config.as_deref())?;
            let clients = LockClients::for_provider(&config.lock).await;
            let lock = build_lock(&config.lock, &clients)?;
            println!("{}", cmd_lock(lock.as_ref(), &action).await?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<GateConfig> {
    let Some(path) = path else {
        bail!("No configuration given; pass --config or set STACKGATE_CONFIG");
    };
    let config = GateConfig::from_path(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    stackgate_core::log_startup(&config);
    Ok(config)
}

/// One path per line; blank lines and surrounding whitespace are ignored.
fn read_changed_files(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read changed files from {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn cmd_jobs(config: &GateConfig, event_path: &Path, changed: &[String]) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(event_path)
        .with_context(|| format!("Failed to read event file {}", event_path.display()))?;
    let event = VcsEvent::from_json(&raw)
        .with_context(|| format!("Invalid event in {}", event_path.display()))?;

    let graph = ProjectGraph::from_projects(&config.projects)?;
    let impacted = impacted_projects(config, &graph, changed)?;
    info!(
        event = event.name(),
        changed = changed.len(),
        impacted = impacted.len(),
        "building jobs"
    );

    let built = JobBuilder::new(config, &graph).build(&event, &impacted)?;
    Ok(json!({
        "jobs": built.jobs,
        "covers_all_impacted_projects": built.covers_all_impacted_projects,
    }))
}

fn cmd_order(config: &GateConfig) -> Result<Vec<String>> {
    let graph = ProjectGraph::from_projects(&config.projects)?;
    Ok(graph.topological_order()?)
}

async fn cmd_process_queue(
    processor: &RunQueueProcessor,
    interval: Duration,
    once: bool,
) -> Result<()> {
    if once {
        let report = processor.tick().await?;
        print_report(&report);
        return Ok(());
    }

    info!(interval_secs = interval.as_secs(), "run queue processor started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match processor.tick().await {
                    Ok(report) => print_report(&report),
                    Err(err) => warn!(error = %err, "run queue tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down run queue processor");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &TickReport) {
    info!(
        examined = report.examined,
        advanced = report.advanced,
        dequeued = report.dequeued,
        conflicts = report.conflicts,
        "tick"
    );
}

async fn cmd_approve(processor: &RunQueueProcessor, run_id: &str) -> Result<()> {
    let run = processor
        .approve_run(&RunId::from(run_id))
        .await
        .with_context(|| format!("Failed to approve run {run_id}"))?;
    println!("Approved run {} ({})", run.run_id, run.project_name);
    Ok(())
}

async fn cmd_lock(lock: &dyn DistributedLock, action: &LockAction) -> Result<String> {
    match action {
        LockAction::Show { resource } => Ok(match lock.get_lock(resource).await? {
            Some(owner) => format!("{resource} is locked by PR #{owner}"),
            None => format!("{resource} is not locked"),
        }),
        LockAction::Acquire { resource, pr } => {
            let owner = lock.get_lock(resource).await?;
            if owner == Some(*pr) {
                return Ok(format!("{resource} is already locked by PR #{pr}"));
            }
            if lock.lock(*pr, resource).await? {
                info!(resource = %resource, pr, "lock acquired from cli");
                return Ok(format!("Locked {resource} for PR #{pr}"));
            }
            match lock.get_lock(resource).await? {
                Some(holder) => bail!("{resource} is locked by PR #{holder}"),
                None => bail!("Failed to lock {resource}"),
            }
        }
        LockAction::Release { resource } => {
            let Some(owner) = lock.get_lock(resource).await? else {
                return Ok(format!("{resource} is not locked"));
            };
            lock.unlock(resource)
                .await
                .with_context(|| format!("Failed to release {resource}"))?;
            info!(resource = %resource, previous_owner = owner, "lock released from cli");
            Ok(format!("Released {resource} (was PR #{owner})"))
        }
    }
}

struct NoDispatch;

#[async_trait::async_trait]
impl CiTrigger for NoDispatch {
    async fn trigger_workflow(
        &self,
        spec: &stackgate_core::JobSpec,
        _vcs_token: &str,
    ) -> stackgate_core::GateResult<()> {
        Err(stackgate_core::GateError::Trigger(format!(
            "dispatch of {} is not available here",
            spec.run_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgate_core::fakes::RecordingTrigger;
    use stackgate_core::locking::MemoryConditionalTable;
    use stackgate_core::Job;
    use stackgate_state::{BatchType, ProjectRun, RunStatus, RunStore, RunType};

    const CONFIG: &str = r#"{
        "projects": [
            {"name": "network", "dir": "envs/network"},
            {"name": "dev", "dir": "envs/dev", "depends_on": ["network"]},
            {"name": "prod", "dir": "envs/prod"}
        ],
        "dependency_mode": "hard",
        "lock": {"provider": "disabled"}
    }"#;

    const OPENED: &str = r#"{
        "kind": "pull_request",
        "action": "opened",
        "number": 12,
        "repository": {"owner": "myorg", "name": "myrepo"},
        "sender": "alice",
        "head_branch": "feature",
        "base_branch": "main",
        "head_sha": "abc123"
    }"#;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn config(dir: &tempfile::TempDir) -> GateConfig {
        load_config(Some(&write(dir, "stackgate.json", CONFIG))).unwrap()
    }

    #[test]
    fn jobs_cover_dependents_in_hard_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let event = write(&dir, "event.json", OPENED);

        let out = cmd_jobs(&config, &event, &["envs/network/main.tf".to_string()]).unwrap();
        let projects: Vec<&str> = out["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|j| j["projectName"].as_str().unwrap())
            .collect();
        assert_eq!(projects, vec!["network", "dev"]);
        assert_eq!(out["jobs"][0]["commands"][0], "digger plan");
        assert_eq!(out["jobs"][0]["pullRequestNumber"], 12);
        assert_eq!(out["covers_all_impacted_projects"], true);
    }

    #[test]
    fn untouched_projects_produce_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let event = write(&dir, "event.json", OPENED);

        let out = cmd_jobs(&config, &event, &["README.md".to_string()]).unwrap();
        assert!(out["jobs"].as_array().unwrap().is_empty());
    }

    #[test]
    fn changed_files_list_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "changed.txt", "envs/dev/main.tf\n\n  envs/prod/vars.tf  \n");
        assert_eq!(
            read_changed_files(&path).unwrap(),
            vec!["envs/dev/main.tf", "envs/prod/vars.tf"]
        );
    }

    #[test]
    fn malformed_event_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let event = write(&dir, "event.json", r#"{"kind": "deployment"}"#);

        let err = cmd_jobs(&config, &event, &[]).unwrap_err();
        assert!(format!("{err:#}").contains("event.json"));
    }

    #[test]
    fn order_puts_dependencies_first() {
        let dir = tempfile::tempdir().unwrap();
        let order = cmd_order(&config(&dir)).unwrap();
        assert_eq!(order.len(), 3);
        let pos = |n: &str| order.iter().position(|p| p == n).unwrap();
        assert!(pos("network") < pos("dev"));
    }

    #[test]
    fn missing_config_is_an_error() {
        let err = load_config(None).unwrap_err();
        assert!(err.to_string().contains("STACKGATE_CONFIG"));
    }

    #[tokio::test]
    async fn single_tick_dispatches_queued_plan() {
        let store = Arc::new(SurrealStore::in_memory().await.unwrap());
        let trigger = Arc::new(RecordingTrigger::new());
        let scheduler = Arc::new(Scheduler::new(store.clone(), trigger.clone(), 0, "token"));
        let job = Job {
            job_type: "digger plan".to_string(),
            project_name: "dev".to_string(),
            commands: vec!["digger plan".to_string()],
            namespace: "myorg/myrepo".to_string(),
            ..Job::default()
        };
        let (batch, _) = scheduler
            .create_batch(BatchType::Plan, "myorg/myrepo", Some(12), None, &[job])
            .await
            .unwrap();
        let processor = RunQueueProcessor::new(store.clone(), scheduler);
        let run = ProjectRun::new("dev", "myorg/myrepo", RunType::PlanOnly, batch.batch_id, None);
        let run_id = run.run_id.clone();
        processor.submit(run).await.unwrap();

        cmd_process_queue(&processor, Duration::from_secs(1), true)
            .await
            .unwrap();

        assert_eq!(trigger.dispatched_projects(), vec!["dev"]);
        assert_eq!(store.get_run(&run_id).await.unwrap().status, RunStatus::Planning);
    }

    fn table_lock() -> Arc<dyn DistributedLock> {
        let config = GateConfig::from_json(r#"{"projects": [], "lock": {"provider": "aws"}}"#).unwrap();
        let clients = LockClients {
            conditional_table: Some(Arc::new(MemoryConditionalTable::new())),
            ..LockClients::default()
        };
        build_lock(&config.lock, &clients).unwrap()
    }

    #[tokio::test]
    async fn lock_commands_acquire_show_and_release() {
        let lock = table_lock();
        let resource = "myorg/myrepo#dev".to_string();
        let show = LockAction::Show {
            resource: resource.clone(),
        };

        assert_eq!(cmd_lock(lock.as_ref(), &show).await.unwrap(), "myorg/myrepo#dev is not locked");
        let acquire = LockAction::Acquire {
            resource: resource.clone(),
            pr: 11,
        };
        assert_eq!(
            cmd_lock(lock.as_ref(), &acquire).await.unwrap(),
            "Locked myorg/myrepo#dev for PR #11"
        );
        assert!(cmd_lock(lock.as_ref(), &acquire).await.unwrap().contains("already locked"));
        assert_eq!(
            cmd_lock(lock.as_ref(), &show).await.unwrap(),
            "myorg/myrepo#dev is locked by PR #11"
        );

        let rival = LockAction::Acquire {
            resource: resource.clone(),
            pr: 12,
        };
        let err = cmd_lock(lock.as_ref(), &rival).await.unwrap_err();
        assert!(err.to_string().contains("locked by PR #11"));

        let release = LockAction::Release { resource };
        assert!(cmd_lock(lock.as_ref(), &release).await.unwrap().contains("was PR #11"));
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn approve_rejects_runs_not_awaiting_approval() {
        let store = Arc::new(SurrealStore::in_memory().await.unwrap());
        let scheduler = Arc::new(Scheduler::new(store.clone(), Arc::new(NoDispatch), 0, ""));
        let processor = RunQueueProcessor::new(store, scheduler);
        let run = ProjectRun::new(
            "dev",
            "myorg/myrepo",
            RunType::PlanAndApply,
            stackgate_state::BatchId::new(),
            None,
        );
        let run_id = run.run_id.to_string();
        processor.submit(run).await.unwrap();

        let err = cmd_approve(&processor, &run_id).await.unwrap_err();
        assert!(format!("{err:#}").contains(&run_id));
    }
}
