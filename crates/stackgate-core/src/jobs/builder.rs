//! Event + impacted projects → ordered jobs.

use std::collections::HashSet;

use tracing::{debug, info};

use super::{parse_comment, run_env_vars, Command, Job};
use crate::config::{GateConfig, Project, Workflow};
use crate::error::{GateError, GateResult};
use crate::events::{PullRequestAction, VcsEvent};
use crate::graph::ProjectGraph;

/// Builder output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuiltJobs {
    pub jobs: Vec<Job>,
    /// False when a comment narrowed the run to a subset of the impacted
    /// projects.
    pub covers_all_impacted_projects: bool,
}

/// Per-event shared fields.
struct EventContext<'e> {
    event_name: &'static str,
    namespace: String,
    requested_by: &'e str,
    pr_number: Option<u64>,
    branch: &'e str,
    commit: &'e str,
}

/// Converts events into jobs using the configured workflows.
pub struct JobBuilder<'a> {
    config: &'a GateConfig,
    graph: &'a ProjectGraph,
    env_lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync + 'a>,
}

impl<'a> JobBuilder<'a> {
    /// `value_from` env vars are read from the process environment.
    pub fn new(config: &'a GateConfig, graph: &'a ProjectGraph) -> Self {
        Self {
            config,
            graph,
            env_lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'a,
    ) -> Self {
        self.env_lookup = Box::new(lookup);
        self
    }

    /// Jobs for `event`, upstream projects first.
    ///
    /// Fails before producing any job when a project's workflow is missing
    /// or a comment names a project outside `impacted`.
    pub fn build(&self, event: &VcsEvent, impacted: &[Project]) -> GateResult<BuiltJobs> {
        let default_branch = self.config.default_branch.as_str();
        let (ctx, selected, commands_for): (EventContext<'_>, Vec<&Project>, CommandSource) =
            match event {
                VcsEvent::PullRequest(pr) => {
                    let source = match pr.action {
                        PullRequestAction::Opened
                        | PullRequestAction::Reopened
                        | PullRequestAction::Synchronize => {
                            if pr.draft && !self.config.allow_draft_prs {
                                debug!(pr = pr.number, "skipping draft pull request");
                                return Ok(BuiltJobs::empty());
                            }
                            CommandSource::Pushed
                        }
                        PullRequestAction::Closed
                            if pr.merged && pr.base_branch == default_branch =>
                        {
                            CommandSource::CommitToDefault
                        }
                        PullRequestAction::Closed => CommandSource::Closed,
                        PullRequestAction::ConvertedToDraft => CommandSource::ConvertedToDraft,
                        PullRequestAction::ReadyForReview | PullRequestAction::Edited => {
                            return Ok(BuiltJobs::empty());
                        }
                    };
                    let ctx = EventContext {
                        event_name: if pr.action == PullRequestAction::ConvertedToDraft {
                            "pull_request_converted_to_draft"
                        } else {
                            event.name()
                        },
                        namespace: pr.repository.full_name(),
                        requested_by: &pr.sender,
                        pr_number: Some(pr.number),
                        branch: &pr.head_branch,
                        commit: &pr.head_sha,
                    };
                    (ctx, impacted.iter().collect(), source)
                }
                VcsEvent::IssueComment(comment) => {
                    let Some(parsed) = parse_comment(&comment.body)? else {
                        return Ok(BuiltJobs::empty());
                    };
                    let selected = select_requested(impacted, &parsed.projects)?;
                    let covers_all = selected.len() == impacted.len();
                    let ctx = EventContext {
                        event_name: event.name(),
                        namespace: comment.repository.full_name(),
                        requested_by: &comment.sender,
                        pr_number: Some(comment.number),
                        branch: &comment.head_branch,
                        commit: &comment.head_sha,
                    };
                    return self.finish(
                        ctx,
                        selected,
                        CommandSource::Comment(parsed.command, parsed.workspace),
                        covers_all,
                    );
                }
                VcsEvent::Push(push) => {
                    if push.branch != default_branch {
                        debug!(branch = %push.branch, "push to non-default branch ignored");
                        return Ok(BuiltJobs::empty());
                    }
                    let ctx = EventContext {
                        event_name: event.name(),
                        namespace: push.repository.full_name(),
                        requested_by: &push.sender,
                        pr_number: None,
                        branch: &push.branch,
                        commit: &push.head_sha,
                    };
                    (ctx, impacted.iter().collect(), CommandSource::CommitToDefault)
                }
                VcsEvent::MergeGroup(group) => {
                    let ctx = EventContext {
                        event_name: event.name(),
                        namespace: group.repository.full_name(),
                        requested_by: &group.sender,
                        pr_number: None,
                        branch: &group.head_branch,
                        commit: &group.head_sha,
                    };
                    (
                        ctx,
                        impacted.iter().collect(),
                        CommandSource::Comment(Command::Plan, None),
                    )
                }
            };

        self.finish(ctx, selected, commands_for, true)
    }

    fn finish(
        &self,
        ctx: EventContext<'_>,
        selected: Vec<&Project>,
        source: CommandSource,
        covers_all_impacted_projects: bool,
    ) -> GateResult<BuiltJobs> {
        let mut jobs = Vec::with_capacity(selected.len());
        for project in selected {
            let workflow = self.workflow_for(project)?;
            let commands = source.commands(workflow, self.config.allow_draft_prs);
            if commands.is_empty() {
                debug!(project = %project.name, event = ctx.event_name, "no commands configured");
                continue;
            }
            let workspace = match &source {
                CommandSource::Comment(_, Some(ws)) => ws.clone(),
                _ => project.workspace.clone(),
            };
            jobs.push(self.job_for(project, workflow, &ctx, commands, workspace));
        }

        let jobs = self.graph.sorted_jobs_by_dependency(jobs)?;
        info!(
            event = ctx.event_name,
            namespace = %ctx.namespace,
            jobs = jobs.len(),
            covers_all_impacted_projects,
            "built jobs"
        );
        Ok(BuiltJobs {
            jobs,
            covers_all_impacted_projects,
        })
    }

    fn workflow_for(&self, project: &Project) -> GateResult<&'a Workflow> {
        self.config
            .workflows
            .get(&project.workflow)
            .ok_or_else(|| GateError::UnknownWorkflow {
                workflow: project.workflow.clone(),
                project: project.name.clone(),
            })
    }

    fn job_for(
        &self,
        project: &Project,
        workflow: &Workflow,
        ctx: &EventContext<'_>,
        commands: Vec<String>,
        workspace: String,
    ) -> Job {
        let (state_env_vars, command_env_vars) = workflow.env_vars.collect(&self.env_lookup);
        Job {
            job_type: commands.first().cloned().unwrap_or_default(),
            project_name: project.name.clone(),
            project_dir: project.dir.clone(),
            project_workspace: workspace,
            project_workflow: project.workflow.clone(),
            terragrunt: project.terragrunt,
            opentofu: project.opentofu,
            pulumi: project.pulumi,
            commands,
            apply_stage: workflow.apply.clone(),
            plan_stage: workflow.plan.clone(),
            pull_request_number: ctx.pr_number,
            commit: ctx.commit.to_string(),
            branch: ctx.branch.to_string(),
            event_name: ctx.event_name.to_string(),
            requested_by: ctx.requested_by.to_string(),
            namespace: ctx.namespace.clone(),
            run_env_vars: run_env_vars(
                &self.config.default_branch,
                ctx.branch,
                &project.name,
                &project.dir,
            ),
            state_env_vars,
            command_env_vars,
            skip_merge_check: workflow.configuration.skip_merge_check,
            ..Job::default()
        }
    }
}

impl BuiltJobs {
    fn empty() -> Self {
        Self {
            jobs: Vec::new(),
            covers_all_impacted_projects: true,
        }
    }
}

/// Where a job's command list comes from.
enum CommandSource {
    Pushed,
    Closed,
    CommitToDefault,
    ConvertedToDraft,
    /// A single explicit command, with an optional workspace override.
    Comment(Command, Option<String>),
}

impl CommandSource {
    fn commands(&self, workflow: &Workflow, allow_draft_prs: bool) -> Vec<String> {
        let cfg = &workflow.configuration;
        match self {
            CommandSource::Pushed => cfg.on_pull_request_pushed.clone(),
            CommandSource::Closed => cfg.on_pull_request_closed.clone(),
            CommandSource::CommitToDefault => cfg.on_commit_to_default.clone(),
            CommandSource::ConvertedToDraft => {
                if cfg.on_pull_request_converted_to_draft.is_empty() && !allow_draft_prs {
                    vec![Command::Unlock.as_str().to_string()]
                } else {
                    cfg.on_pull_request_converted_to_draft.clone()
                }
            }
            CommandSource::Comment(command, _) => vec![command.as_str().to_string()],
        }
    }
}

/// Narrow `impacted` to the requested projects. Every requested project
/// must be impacted.
fn select_requested<'p>(impacted: &'p [Project], requested: &[String]) -> GateResult<Vec<&'p Project>> {
    if requested.is_empty() {
        return Ok(impacted.iter().collect());
    }
    let impacted_names: HashSet<&str> = impacted.iter().map(|p| p.name.as_str()).collect();
    if let Some(missing) = requested.iter().find(|r| !impacted_names.contains(r.as_str())) {
        return Err(GateError::ProjectNotImpacted {
            project: missing.clone(),
        });
    }
    Ok(impacted
        .iter()
        .filter(|p| requested.iter().any(|r| r == &p.name))
        .collect())
}
