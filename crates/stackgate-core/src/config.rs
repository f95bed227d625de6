//! Orchestrator configuration.
//!
//! One [`GateConfig`] is built at startup and passed by reference to every
//! component. There is no process-global configuration state.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

pub const DEFAULT_WORKFLOW: &str = "default";
pub const DEFAULT_WORKSPACE: &str = "default";

/// Default conditional-table name for the AWS lock backend.
pub const DEFAULT_LOCK_TABLE: &str = "DiggerDynamoDBLockTable";
/// Default table name for the Azure lock backend.
pub const DEFAULT_ENTITY_TABLE: &str = "DIGGERLOCK";

fn default_workflow_name() -> String {
    DEFAULT_WORKFLOW.to_string()
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_source() -> String {
    "stackgate".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub projects: Vec<Project>,
    #[serde(default)]
    pub workflows: HashMap<String, Workflow>,
    #[serde(default)]
    pub dependency_mode: DependencyMode,
    #[serde(default)]
    pub allow_draft_prs: bool,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_concurrency_per_batch: u32,
    #[serde(default = "default_true")]
    pub require_approval: bool,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub collect_usage_data: bool,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            workflows: HashMap::new(),
            dependency_mode: DependencyMode::default(),
            allow_draft_prs: false,
            default_branch: default_branch(),
            max_concurrency_per_batch: 0,
            require_approval: true,
            lock: LockConfig::default(),
            collect_usage_data: false,
            source: default_source(),
        }
    }
}

impl GateConfig {
    /// Parse JSON and fill in the built-in default workflow.
    pub fn from_json(json: &str) -> GateResult<Self> {
        let mut config: GateConfig = serde_json::from_str(json)
            .map_err(|e| GateError::Config(format!("invalid configuration: {e}")))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> GateResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Insert the default workflow if missing and reject duplicate project
    /// names.
    pub fn normalize(&mut self) -> GateResult<()> {
        self.workflows
            .entry(DEFAULT_WORKFLOW.to_string())
            .or_insert_with(Workflow::default_workflow);

        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.name.as_str()) {
                return Err(GateError::Config(format!(
                    "project name '{}' is declared more than once",
                    project.name
                )));
            }
        }
        Ok(())
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// How dependencies widen the impacted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// Dependencies only order jobs.
    #[default]
    Soft,
    /// Dependents of an impacted project are impacted too.
    Hard,
}

/// An independently planned and applied infrastructure unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub dir: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_workflow_name")]
    pub workflow: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub terragrunt: bool,
    #[serde(default)]
    pub opentofu: bool,
    #[serde(default)]
    pub pulumi: bool,
    #[serde(default = "default_true")]
    pub drift_detection: bool,
}

impl Project {
    pub fn new(name: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            workspace: default_workspace(),
            workflow: default_workflow_name(),
            depends_on: Vec::new(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            terragrunt: false,
            opentofu: false,
            pulumi: false,
            drift_detection: true,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Named command configuration for a set of projects.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub plan: Option<Stage>,
    #[serde(default)]
    pub apply: Option<Stage>,
    #[serde(default)]
    pub env_vars: EnvVars,
    #[serde(default)]
    pub configuration: WorkflowConfiguration,
}

impl Workflow {
    /// init+plan, init+apply, plan on push, unlock on close and merge.
    pub fn default_workflow() -> Self {
        Self {
            plan: Some(Stage::from_actions(&["init", "plan"])),
            apply: Some(Stage::from_actions(&["init", "apply"])),
            env_vars: EnvVars::default(),
            configuration: WorkflowConfiguration::default(),
        }
    }
}

/// Which commands fire on which VCS actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    pub on_pull_request_pushed: Vec<String>,
    pub on_pull_request_closed: Vec<String>,
    pub on_commit_to_default: Vec<String>,
    /// Empty means "unlock" unless draft PRs are allowed.
    #[serde(default)]
    pub on_pull_request_converted_to_draft: Vec<String>,
    #[serde(default)]
    pub skip_merge_check: bool,
}

impl Default for WorkflowConfiguration {
    fn default() -> Self {
        Self {
            on_pull_request_pushed: vec!["digger plan".to_string()],
            on_pull_request_closed: vec!["digger unlock".to_string()],
            on_commit_to_default: vec!["digger unlock".to_string()],
            on_pull_request_converted_to_draft: Vec::new(),
            skip_merge_check: false,
        }
    }
}

/// Ordered steps for plan or apply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_regex: Option<String>,
}

impl Stage {
    pub fn from_actions(actions: &[&str]) -> Self {
        Self {
            steps: actions.iter().map(|a| Step::action(a)).collect(),
            filter_regex: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub action: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub shell: String,
}

impl Step {
    pub fn action(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvVars {
    #[serde(default)]
    pub state: Vec<EnvVar>,
    #[serde(default)]
    pub commands: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Read from this process environment variable at job build time.
    #[serde(default)]
    pub value_from: Option<String>,
}

impl EnvVars {
    /// Resolve into `(state, commands)` maps. A literal value wins over
    /// `value_from`; entries with neither are dropped.
    pub fn collect(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> (HashMap<String, String>, HashMap<String, String>) {
        let resolve = |vars: &[EnvVar]| {
            vars.iter()
                .filter_map(|v| {
                    let value = match (&v.value, &v.value_from) {
                        (Some(value), _) if !value.is_empty() => value.clone(),
                        (_, Some(from)) if !from.is_empty() => lookup(from).unwrap_or_default(),
                        _ => return None,
                    };
                    Some((v.name.clone(), value))
                })
                .collect()
        };
        (resolve(&self.state), resolve(&self.commands))
    }
}

/// Which lock backend to build. See [`crate::locking::build_lock`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum LockConfig {
    /// Conditional-write key/value table.
    Aws {
        #[serde(default = "default_lock_table")]
        table: String,
    },
    /// Object storage bucket.
    Gcp { bucket: String },
    /// Structured storage table.
    Azure {
        #[serde(default = "default_entity_table")]
        table: String,
    },
    /// Locking administratively disabled.
    #[default]
    Disabled,
}

fn default_lock_table() -> String {
    DEFAULT_LOCK_TABLE.to_string()
}

fn default_entity_table() -> String {
    DEFAULT_ENTITY_TABLE.to_string()
}
