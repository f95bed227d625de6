//! Policy collaborator contract.

use async_trait::async_trait;

use crate::error::GateResult;

/// Who wants to do what, where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest<'a> {
    pub organisation: &'a str,
    pub repository: &'a str,
    pub project: &'a str,
    /// Full command, e.g. `digger apply`.
    pub command: &'a str,
    pub pr_number: Option<u64>,
    pub requested_by: &'a str,
    /// Plan policy violations of the stored plan; only set before apply.
    pub plan_policy_violations: &'a [String],
}

/// Result of evaluating a plan against plan policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanPolicyOutcome {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl PlanPolicyOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    pub fn fail(violations: Vec<String>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }
}

/// Access, plan and drift policies. Errors mean the policy service itself
/// failed; a denial is `Ok(false)`.
#[async_trait]
pub trait PolicyChecker: Send + Sync {
    async fn check_access_policy(&self, request: &AccessRequest<'_>) -> GateResult<bool>;

    async fn check_plan_policy(
        &self,
        repository: &str,
        project: &str,
        plan_json: &str,
    ) -> GateResult<PlanPolicyOutcome>;

    async fn check_drift_policy(
        &self,
        organisation: &str,
        repository: &str,
        project: &str,
    ) -> GateResult<bool>;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPolicyChecker;

#[async_trait]
impl PolicyChecker for NoOpPolicyChecker {
    async fn check_access_policy(&self, _request: &AccessRequest<'_>) -> GateResult<bool> {
        Ok(true)
    }

    async fn check_plan_policy(
        &self,
        _repository: &str,
        _project: &str,
        _plan_json: &str,
    ) -> GateResult<PlanPolicyOutcome> {
        Ok(PlanPolicyOutcome::pass())
    }

    async fn check_drift_policy(
        &self,
        _organisation: &str,
        _repository: &str,
        _project: &str,
    ) -> GateResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_allows_everything() {
        let checker = NoOpPolicyChecker;
        let request = AccessRequest {
            organisation: "myorg",
            repository: "myrepo",
            project: "dev",
            command: "digger apply",
            pr_number: Some(11),
            requested_by: "mallory",
            plan_policy_violations: &[],
        };
        assert!(checker.check_access_policy(&request).await.unwrap());
        assert!(checker.check_plan_policy("myrepo", "dev", "{}").await.unwrap().passed);
        assert!(checker.check_drift_policy("myorg", "myrepo", "dev").await.unwrap());
    }
}
