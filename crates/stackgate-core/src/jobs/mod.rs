//! Job descriptors, the command vocabulary and the job builder.
//!
//! A [`Job`] is one project's ordered command list for one event. It is
//! also the JSON document handed to out-of-process CI runners, so field
//! names follow the existing runner wire format.

mod builder;
mod comment;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Stage;
use crate::error::GateResult;

pub use builder::{BuiltJobs, JobBuilder};
pub use comment::{parse_comment, CommentCommand};

/// Commands a job can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Plan,
    Apply,
    Unlock,
    Lock,
    DriftDetect,
    Destroy,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Plan,
        Command::Apply,
        Command::Unlock,
        Command::Lock,
        Command::DriftDetect,
        Command::Destroy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Plan => "digger plan",
            Command::Apply => "digger apply",
            Command::Unlock => "digger unlock",
            Command::Lock => "digger lock",
            Command::DriftDetect => "digger drift-detect",
            Command::Destroy => "digger destroy",
        }
    }

    /// Exact command string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Short name used in statuses and policy checks (`plan`, `apply`, ...).
    pub fn action(&self) -> &'static str {
        match self {
            Command::Plan => "plan",
            Command::Apply => "apply",
            Command::Unlock => "unlock",
            Command::Lock => "lock",
            Command::DriftDetect => "drift-detect",
            Command::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One project's work for one event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// First command of the job, e.g. `digger plan`.
    #[serde(rename = "job_type", default)]
    pub job_type: String,
    pub project_name: String,
    pub project_dir: String,
    pub project_workspace: String,
    #[serde(default)]
    pub project_workflow: String,
    #[serde(default)]
    pub terragrunt: bool,
    #[serde(default)]
    pub opentofu: bool,
    #[serde(default)]
    pub pulumi: bool,
    pub commands: Vec<String>,
    #[serde(default)]
    pub apply_stage: Option<Stage>,
    #[serde(default)]
    pub plan_stage: Option<Stage>,
    #[serde(default)]
    pub pull_request_number: Option<u64>,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub branch: String,
    pub event_name: String,
    pub requested_by: String,
    pub namespace: String,
    #[serde(default)]
    pub run_env_vars: HashMap<String, String>,
    #[serde(default)]
    pub state_env_vars: HashMap<String, String>,
    #[serde(default)]
    pub command_env_vars: HashMap<String, String>,
    #[serde(rename = "backend_hostname", alias = "backendHostname", default)]
    pub backend_hostname: String,
    #[serde(rename = "backend_job_token", alias = "backendJobToken", default)]
    pub backend_job_token: String,
    #[serde(rename = "skip_merge_check", default)]
    pub skip_merge_check: bool,
}

impl Job {
    pub fn is_plan(&self) -> bool {
        self.has_command(Command::Plan)
    }

    pub fn is_apply(&self) -> bool {
        self.has_command(Command::Apply)
    }

    pub fn has_command(&self, command: Command) -> bool {
        self.commands.iter().any(|c| c == command.as_str())
    }

    /// Lock namespace plus project, as used by [`crate::locking::lock_id`].
    pub fn lock_id(&self) -> String {
        crate::locking::lock_id(&self.namespace, &self.project_name)
    }

    /// Where this job's plan artifact is stored.
    pub fn plan_file_name(&self) -> String {
        plan_file_name(&self.namespace, self.pull_request_number, &self.project_name)
    }

    pub fn to_spec(&self, run_name: impl Into<String>) -> JobSpec {
        JobSpec {
            run_name: run_name.into(),
            job: self.clone(),
        }
    }

    pub fn to_json(&self) -> GateResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> GateResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// What the CI trigger dispatches: the serialized job plus a display name
/// for the workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub run_name: String,
    #[serde(flatten)]
    pub job: Job,
}

impl JobSpec {
    pub fn to_value(&self) -> GateResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> GateResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// `myorg/myrepo`, PR 11, `dev` → `myorg-myrepo-11-dev.tfplan`.
pub fn plan_file_name(namespace: &str, pr_number: Option<u64>, project_name: &str) -> String {
    let prefix = namespace.replace('/', "-");
    match pr_number {
        Some(pr) => format!("{prefix}-{pr}-{project_name}.tfplan"),
        None => format!("{prefix}-{project_name}.tfplan"),
    }
}

/// Run env vars exposed to every step.
pub(crate) fn run_env_vars(
    default_branch: &str,
    pr_branch: &str,
    project_name: &str,
    project_dir: &str,
) -> HashMap<String, String> {
    HashMap::from([
        ("DEFAULT_BRANCH".to_string(), default_branch.to_string()),
        ("PR_BRANCH".to_string(), pr_branch.to_string()),
        ("PROJECT_NAME".to_string(), project_name.to_string()),
        ("PROJECT_DIR".to_string(), project_dir.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parse_is_case_insensitive() {
        assert_eq!(Command::parse("DiGGeR PlAn"), Some(Command::Plan));
        assert_eq!(Command::parse(" digger drift-detect "), Some(Command::DriftDetect));
        assert_eq!(Command::parse("digger deploy"), None);
    }

    #[test]
    fn plan_file_name_with_and_without_pr() {
        assert_eq!(
            plan_file_name("myorg/myrepo", Some(11), "dev"),
            "myorg-myrepo-11-dev.tfplan"
        );
        assert_eq!(plan_file_name("myorg/myrepo", None, "dev"), "myorg-myrepo-dev.tfplan");
    }

    #[test]
    fn wire_format_uses_runner_field_names() {
        let job = Job {
            job_type: "digger plan".to_string(),
            project_name: "dev".to_string(),
            project_dir: "envs/dev".to_string(),
            project_workspace: "default".to_string(),
            commands: vec!["digger plan".to_string()],
            pull_request_number: Some(11),
            event_name: "pull_request".to_string(),
            requested_by: "alice".to_string(),
            namespace: "myorg/myrepo".to_string(),
            backend_hostname: "https://gate.example.com".to_string(),
            ..Job::default()
        };
        let value: serde_json::Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();
        assert_eq!(value["projectName"], "dev");
        assert_eq!(value["pullRequestNumber"], 11);
        assert_eq!(value["job_type"], "digger plan");
        assert_eq!(value["backend_hostname"], "https://gate.example.com");
        assert!(value.get("stateEnvVars").is_some());
        assert!(job.is_plan());
        assert!(!job.is_apply());
    }

    #[test]
    fn spec_accepts_camel_case_backend_fields() {
        let json = r#"{
            "run_name": "dev plan",
            "projectName": "dev",
            "projectDir": "envs/dev",
            "projectWorkspace": "default",
            "commands": ["digger apply"],
            "eventName": "push",
            "requestedBy": "bot",
            "namespace": "myorg/myrepo",
            "backendJobToken": "t0ken"
        }"#;
        let spec = JobSpec::from_value(&serde_json::from_str(json).unwrap()).unwrap();
        assert_eq!(spec.run_name, "dev plan");
        assert_eq!(spec.job.backend_job_token, "t0ken");
        assert!(spec.job.is_apply());
        assert_eq!(spec.job.pull_request_number, None);
    }
}
