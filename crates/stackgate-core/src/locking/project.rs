//! Per-project, per-change-request locking with hanging-lock recovery.

use std::sync::Arc;

use tracing::{info, warn};

use super::DistributedLock;
use crate::error::GateResult;
use crate::vcs::PullRequestService;

/// Lock resource for a project: `"<namespace>#<project>"`.
pub fn lock_id(namespace: &str, project_name: &str) -> String {
    format!("{namespace}#{project_name}")
}

/// Binds a [`DistributedLock`] to one project within one change request.
///
/// The owner recorded in the backend is the PR number.
#[derive(Clone)]
pub struct ProjectLock {
    lock: Arc<dyn DistributedLock>,
    pr_service: Arc<dyn PullRequestService>,
    project_name: String,
    namespace: String,
    pr_number: u64,
}

impl ProjectLock {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        pr_service: Arc<dyn PullRequestService>,
        project_name: impl Into<String>,
        namespace: impl Into<String>,
        pr_number: u64,
    ) -> Self {
        Self {
            lock,
            pr_service,
            project_name: project_name.into(),
            namespace: namespace.into(),
            pr_number,
        }
    }

    pub fn lock_id(&self) -> String {
        lock_id(&self.namespace, &self.project_name)
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn pr_number(&self) -> u64 {
        self.pr_number
    }

    /// Acquire for this PR.
    ///
    /// Returns `Ok(true)` when this PR holds the lock afterwards, including
    /// when it already did. `Ok(false)` means another open PR holds it; a
    /// notice has been published on this PR.
    pub async fn lock(&self) -> GateResult<bool> {
        let resource = self.lock_id();
        if !self.verify_no_hanging_locks().await? {
            return Ok(false);
        }

        if self.lock.get_lock(&resource).await? == Some(self.pr_number) {
            return Ok(true);
        }

        let acquired = self.lock.lock(self.pr_number, &resource).await?;
        if acquired {
            info!(resource = %resource, pr = self.pr_number, "project locked");
            if !self.lock.is_noop() {
                self.notify(&format!(
                    "Project {} has been locked by PR #{}",
                    resource, self.pr_number
                ))
                .await;
            }
        } else if let Some(owner) = self.lock.get_lock(&resource).await? {
            // Lost a race after the hanging-lock check.
            self.notify(&self.locked_by_other_message(owner)).await;
        }
        Ok(acquired)
    }

    /// Release only if this PR is the current owner.
    pub async fn unlock(&self) -> GateResult<bool> {
        let resource = self.lock_id();
        if self.lock.get_lock(&resource).await? != Some(self.pr_number) {
            return Ok(false);
        }
        let released = self.lock.unlock(&resource).await?;
        if released {
            info!(resource = %resource, pr = self.pr_number, "project unlocked");
            self.notify(&unlocked_message(&resource)).await;
        }
        Ok(released)
    }

    /// Release regardless of owner. `Ok(false)` when nothing was held.
    pub async fn force_unlock(&self) -> GateResult<bool> {
        let resource = self.lock_id();
        let Some(owner) = self.lock.get_lock(&resource).await? else {
            return Ok(false);
        };
        let released = self.lock.unlock(&resource).await?;
        if released {
            info!(resource = %resource, previous_owner = owner, pr = self.pr_number, "project force unlocked");
            self.notify(&unlocked_message(&resource)).await;
        }
        Ok(released)
    }

    /// `Ok(true)` when the resource is free or held by this PR. A lock held
    /// by a closed PR is released on the spot.
    pub async fn verify_no_hanging_locks(&self) -> GateResult<bool> {
        let resource = self.lock_id();
        let owner = match self.lock.get_lock(&resource).await? {
            Some(owner) if owner != self.pr_number => owner,
            _ => return Ok(true),
        };

        if self.pr_service.is_closed(owner).await? {
            warn!(resource = %resource, stale_owner = owner, "releasing lock held by closed PR");
            self.lock.unlock(&resource).await?;
            return Ok(true);
        }

        info!(resource = %resource, owner, pr = self.pr_number, "project locked by another PR");
        self.notify(&self.locked_by_other_message(owner)).await;
        Ok(false)
    }

    fn locked_by_other_message(&self, owner: u64) -> String {
        format!(
            "Project {} locked by another PR #{} (failed to acquire lock {}). \
             The locking plan must be applied or discarded before future plans can execute",
            self.lock_id(),
            owner,
            self.project_name
        )
    }

    async fn notify(&self, body: &str) {
        if let Err(err) = self.pr_service.publish_comment(self.pr_number, body).await {
            warn!(pr = self.pr_number, error = %err, "failed to publish lock notice");
        }
    }
}

fn unlocked_message(resource: &str) -> String {
    format!("Project unlocked ({resource}).")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakePullRequestService;
    use crate::locking::{BackendLock, MemoryEntityTable, EntityTableBackend, NoOpLock};

    fn shared_lock() -> Arc<dyn DistributedLock> {
        Arc::new(BackendLock::new(
            Arc::new(EntityTableBackend::new(
                Arc::new(MemoryEntityTable::new()),
                "DIGGERLOCK",
            )),
            None,
        ))
    }

    fn project_lock(
        lock: &Arc<dyn DistributedLock>,
        vcs: &Arc<FakePullRequestService>,
        pr: u64,
    ) -> ProjectLock {
        ProjectLock::new(lock.clone(), vcs.clone(), "dev", "myorg/myrepo", pr)
    }

    #[test]
    fn lock_id_is_namespaced() {
        assert_eq!(lock_id("myorg/myrepo", "dev"), "myorg/myrepo#dev");
        assert_ne!(lock_id("a/one", "dev"), lock_id("a/two", "dev"));
    }

    #[tokio::test]
    async fn second_pr_is_refused_with_notice() {
        let lock = shared_lock();
        let vcs = Arc::new(FakePullRequestService::new());
        let pr11 = project_lock(&lock, &vcs, 11);
        let pr12 = project_lock(&lock, &vcs, 12);

        assert!(pr11.lock().await.unwrap());
        assert!(!pr12.lock().await.unwrap());
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));

        let notices = vcs.comments_on(12);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("locked by another PR #11"));
        assert!(vcs.comments_on(11)[0].contains("has been locked by PR #11"));
    }

    #[tokio::test]
    async fn relocking_by_same_pr_is_idempotent() {
        let lock = shared_lock();
        let vcs = Arc::new(FakePullRequestService::new());
        let pr11 = project_lock(&lock, &vcs, 11);

        assert!(pr11.lock().await.unwrap());
        assert!(pr11.lock().await.unwrap());
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));
        // Only the first acquire announces the lock.
        assert_eq!(vcs.comments_on(11).len(), 1);
    }

    #[tokio::test]
    async fn non_owner_unlock_is_a_noop() {
        let lock = shared_lock();
        let vcs = Arc::new(FakePullRequestService::new());
        project_lock(&lock, &vcs, 11).lock().await.unwrap();

        assert!(!project_lock(&lock, &vcs, 12).unlock().await.unwrap());
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(11));

        assert!(project_lock(&lock, &vcs, 11).unlock().await.unwrap());
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);
        assert!(vcs
            .comments_on(11)
            .iter()
            .any(|c| c == "Project unlocked (myorg/myrepo#dev)."));
    }

    #[tokio::test]
    async fn lock_of_closed_pr_is_recovered() {
        let lock = shared_lock();
        let vcs = Arc::new(FakePullRequestService::new());
        project_lock(&lock, &vcs, 11).lock().await.unwrap();
        vcs.close(11);

        assert!(project_lock(&lock, &vcs, 12).lock().await.unwrap());
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn force_unlock_ignores_owner() {
        let lock = shared_lock();
        let vcs = Arc::new(FakePullRequestService::new());
        project_lock(&lock, &vcs, 11).lock().await.unwrap();

        assert!(project_lock(&lock, &vcs, 12).force_unlock().await.unwrap());
        assert_eq!(lock.get_lock("myorg/myrepo#dev").await.unwrap(), None);
        assert!(!project_lock(&lock, &vcs, 12).force_unlock().await.unwrap());
    }

    #[tokio::test]
    async fn noop_lock_publishes_nothing() {
        let lock: Arc<dyn DistributedLock> = Arc::new(NoOpLock);
        let vcs = Arc::new(FakePullRequestService::new());
        assert!(project_lock(&lock, &vcs, 11).lock().await.unwrap());
        assert!(vcs.comments_on(11).is_empty());
    }
}
