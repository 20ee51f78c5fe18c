//! Task attempt repository trait

use async_trait::async_trait;
use uuid::Uuid;

use super::model::TaskAttempt;
use crate::Result;

#[async_trait]
pub trait TaskAttemptRepository: Send + Sync {
    async fn create(&self, attempt: TaskAttempt) -> Result<TaskAttempt>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TaskAttempt>>;

    async fn list(&self) -> Result<Vec<TaskAttempt>>;

    /// Bind the attempt to a container and branch. Clears `worktree_deleted`.
    /// Fails if another attempt already holds the same container ref.
    async fn update_container_ref(
        &self,
        id: Uuid,
        container_ref: &str,
        branch: &str,
    ) -> Result<TaskAttempt>;

    /// Record that the container is gone
    async fn mark_worktree_deleted(&self, id: Uuid) -> Result<()>;

    async fn mark_setup_completed(&self, id: Uuid) -> Result<()>;
}
