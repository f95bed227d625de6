//! GitHub Actions `workflow_dispatch` trigger.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{GateError, GateResult};
use crate::jobs::JobSpec;
use crate::scheduler::CiTrigger;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Where to dispatch workflow runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubActionsConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    /// Workflow file name, e.g. `digger_workflow.yml`.
    pub workflow_file: String,
    /// Branch or tag the workflow runs on.
    pub git_ref: String,
}

impl GithubActionsConfig {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        workflow_file: impl Into<String>,
        git_ref: impl Into<String>,
    ) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            workflow_file: workflow_file.into(),
            git_ref: git_ref.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn dispatch_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/actions/workflows/{}/dispatches",
            self.api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.workflow_file
        )
    }
}

/// Dispatches job specs as GitHub Actions workflow runs.
pub struct GithubActionsTrigger {
    config: GithubActionsConfig,
    http: reqwest::Client,
}

impl GithubActionsTrigger {
    pub fn new(config: GithubActionsConfig) -> GateResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stackgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GateError::Trigger(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    /// `{"ref": ..., "inputs": {"spec": "<job json>", "run_name": ...}}`
    pub fn dispatch_body(&self, spec: &JobSpec) -> GateResult<serde_json::Value> {
        Ok(json!({
            "ref": self.config.git_ref,
            "inputs": {
                "spec": serde_json::to_string(&spec.job)?,
                "run_name": spec.run_name,
            }
        }))
    }
}

#[async_trait]
impl CiTrigger for GithubActionsTrigger {
    async fn trigger_workflow(&self, spec: &JobSpec, vcs_token: &str) -> GateResult<()> {
        let url = self.config.dispatch_url();
        let body = self.dispatch_body(spec)?;
        debug!(url = %url, run_name = %spec.run_name, "dispatching workflow");

        let response = self
            .http
            .post(&url)
            .bearer_auth(vcs_token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::Trigger(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GateError::Trigger(format!("POST {url} returned {status}: {text}")));
        }
        info!(project = %spec.job.project_name, run_name = %spec.run_name, "workflow dispatched");
        Ok(())
    }
}
