//! Container service
//!
//! A container is an isolated working directory bound 1:1 to a task
//! attempt. The reference backend is a git worktree per attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::attempt::{TaskAttempt, TaskAttemptRepository};
use git_worktree::{DiffStream, WorktreeError, WorktreeManager};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ExecutorError, Result};

#[async_trait]
pub trait ContainerService: Send + Sync {
    /// Create a fresh container and record it on the attempt
    async fn create(&self, attempt: &TaskAttempt) -> Result<PathBuf>;

    /// Reuse the attempt's container if it is still present, otherwise
    /// materialize it again
    async fn ensure_exists(&self, attempt: &TaskAttempt) -> Result<PathBuf>;

    async fn is_clean(&self, attempt: &TaskAttempt) -> Result<bool>;

    /// Remove the container. Callers stop running processes first.
    async fn remove(&self, attempt: &TaskAttempt) -> Result<()>;

    /// Changes in the container relative to the attempt's base branch
    async fn get_diff(&self, attempt: &TaskAttempt) -> Result<DiffStream>;

    /// Stage and commit everything; false when there was nothing to commit
    async fn commit_changes(&self, attempt: &TaskAttempt, message: &str) -> Result<bool>;

    /// Remove directories under the container root that git no longer knows
    async fn cleanup_orphans(&self) -> Result<usize>;
}

/// Git worktree backed containers
pub struct WorktreeContainerService {
    worktrees: WorktreeManager,
    attempts: Arc<dyn TaskAttemptRepository>,
    branch_prefix: String,
}

impl WorktreeContainerService {
    pub fn new(
        worktrees: WorktreeManager,
        attempts: Arc<dyn TaskAttemptRepository>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            worktrees,
            attempts,
            branch_prefix: branch_prefix.into(),
        }
    }

    fn branch_for(&self, attempt: &TaskAttempt) -> String {
        attempt
            .branch
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.branch_prefix, attempt.short_id()))
    }

    fn container_path(attempt: &TaskAttempt) -> Result<PathBuf> {
        match &attempt.container_ref {
            Some(path) if !attempt.worktree_deleted => Ok(PathBuf::from(path)),
            _ => Err(ExecutorError::ContainerNotFound {
                attempt_id: attempt.id,
            }),
        }
    }

    async fn record(&self, attempt_id: Uuid, path: &Path, branch: &str) -> Result<PathBuf> {
        let container_ref = path.to_string_lossy();
        self.attempts
            .update_container_ref(attempt_id, &container_ref, branch)
            .await?;
        Ok(path.to_path_buf())
    }
}

fn creation_error(attempt_id: Uuid, err: WorktreeError) -> ExecutorError {
    match err {
        WorktreeError::BranchNotFound { branch } => ExecutorError::BaseBranchMissing { branch },
        source => ExecutorError::ContainerCreateFailed { attempt_id, source },
    }
}

#[async_trait]
impl ContainerService for WorktreeContainerService {
    async fn create(&self, attempt: &TaskAttempt) -> Result<PathBuf> {
        let branch = self.branch_for(attempt);
        let worktree = self
            .worktrees
            .create(&branch, &attempt.base_branch)
            .await
            .map_err(|e| creation_error(attempt.id, e))?;

        info!(
            "Created container {} for attempt {}",
            worktree.path.display(),
            attempt.id
        );
        self.record(attempt.id, &worktree.path, &worktree.branch).await
    }

    async fn ensure_exists(&self, attempt: &TaskAttempt) -> Result<PathBuf> {
        if let Ok(path) = Self::container_path(attempt) {
            if path.exists() && self.worktrees.get(&path).await?.is_some() {
                debug!("Reusing container {} for attempt {}", path.display(), attempt.id);
                return Ok(path);
            }
        }

        let branch = self.branch_for(attempt);
        let worktree = self
            .worktrees
            .ensure(&branch, &attempt.base_branch)
            .await
            .map_err(|e| creation_error(attempt.id, e))?;
        self.record(attempt.id, &worktree.path, &worktree.branch).await
    }

    async fn is_clean(&self, attempt: &TaskAttempt) -> Result<bool> {
        let path = Self::container_path(attempt)?;
        Ok(!self.worktrees.has_uncommitted_changes(&path).await?)
    }

    async fn remove(&self, attempt: &TaskAttempt) -> Result<()> {
        let path = Self::container_path(attempt)?;
        // The branch holds the attempt's work, keep it
        self.worktrees.remove(&path, false).await?;
        self.attempts.mark_worktree_deleted(attempt.id).await?;
        info!("Removed container {} of attempt {}", path.display(), attempt.id);
        Ok(())
    }

    async fn get_diff(&self, attempt: &TaskAttempt) -> Result<DiffStream> {
        let path = Self::container_path(attempt)?;
        Ok(self
            .worktrees
            .diff_against_base(&path, &attempt.base_branch)
            .await?)
    }

    async fn commit_changes(&self, attempt: &TaskAttempt, message: &str) -> Result<bool> {
        let path = Self::container_path(attempt)?;
        let commit = self.worktrees.commit_all(&path, message).await?;
        if let Some(sha) = &commit {
            info!("Committed {} in container of attempt {}", sha, attempt.id);
        }
        Ok(commit.is_some())
    }

    async fn cleanup_orphans(&self) -> Result<usize> {
        Ok(self.worktrees.cleanup_orphan_dirs().await?)
    }
}
