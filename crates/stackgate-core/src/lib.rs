//! Stackgate Core Library
//!
//! Decides what infrastructure commands run for a version-control event, in
//! what order, under which project lock and behind which policy checks.
//! Tooling, policy evaluation and persistence are injected collaborators.
//!
//! ## Key Components
//!
//! - [`locking`]: lock backends, distributed lock, per-PR project lock
//! - [`graph`]: project dependency graph and impacted-project detection
//! - [`jobs`]: job builder, comment commands, job wire format
//! - [`pipeline`]: policy- and lock-gated execution
//! - [`scheduler`]: per-batch concurrency cap for CI dispatch
//! - [`runs`]: plan → approval → apply run state machine

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fakes;
pub mod github;
pub mod glob;
pub mod graph;
pub mod jobs;
pub mod locking;
pub mod pipeline;
pub mod policy;
pub mod runs;
pub mod scheduler;
pub mod telemetry;
pub mod vcs;

pub use config::{DependencyMode, GateConfig, LockConfig, Project, Workflow};
pub use error::{ErrorKind, GateError, GateResult};
pub use events::{PullRequestAction, Repository, VcsEvent};
pub use executor::{ApplyOutcome, Executor, LockingExecutor, PlanOutcome};
pub use github::{GithubActionsConfig, GithubActionsTrigger};
pub use graph::{get_modified_projects, impacted_projects, ProjectGraph};
pub use jobs::{BuiltJobs, Command, Job, JobBuilder, JobSpec};
pub use locking::{build_lock, DistributedLock, LockBackend, LockClients, ProjectLock};
pub use pipeline::{CommandResult, CommandState, DriftNotifier, Pipeline, RunJobsOutcome};
pub use policy::{AccessRequest, NoOpPolicyChecker, PlanPolicyOutcome, PolicyChecker};
pub use runs::{transition, RunQueueProcessor, TickReport};
pub use scheduler::{derive_batch_status, CiTrigger, Scheduler};
pub use telemetry::{init_tracing, log_startup};
pub use vcs::{CommitState, PullRequestService};
