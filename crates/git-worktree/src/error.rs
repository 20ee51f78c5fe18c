//! Worktree errors

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[derive(Debug, Error)]
pub enum WorktreeError {
    /// git exited non-zero or could not be started
    #[error("Git command failed: {message}")]
    GitCommandFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Worktree already exists at {path}")]
    WorktreeExists { path: PathBuf },

    #[error("Branch '{branch}' already exists")]
    BranchExists { branch: String },

    /// Missing both locally and at the configured remote
    #[error("Branch '{branch}' not found")]
    BranchNotFound { branch: String },

    #[error("Not a git repository: {path}")]
    NotAGitRepository { path: PathBuf },

    #[error("Invalid worktree path: {path}")]
    InvalidPath { path: PathBuf },

    /// The directory survived both `git worktree remove` and a plain delete
    #[error("Failed to remove worktree directory {path}")]
    RemoveFailed { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorktreeError {
    pub fn git_failed(message: impl Into<String>) -> Self {
        Self::GitCommandFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn git_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::GitCommandFailed {
            message: message.into(),
            source: Some(source),
        }
    }
}
