//! Error types for agent-runner

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while running executions
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Worktree operation failed
    #[error("Worktree error: {0}")]
    Worktree(#[from] git_worktree::WorktreeError),

    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(#[from] conductor_core::Error),

    /// The attempt has no usable container
    #[error("No container for attempt {attempt_id}")]
    ContainerNotFound { attempt_id: Uuid },

    /// Creating the working directory failed
    #[error("Failed to create container for attempt {attempt_id}: {source}")]
    ContainerCreateFailed {
        attempt_id: Uuid,
        #[source]
        source: git_worktree::WorktreeError,
    },

    /// Base branch exists neither at the remote nor locally
    #[error("Base branch '{branch}' does not exist")]
    BaseBranchMissing { branch: String },

    /// Failed to spawn agent process
    #[error("Failed to spawn process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Task attempt not found
    #[error("Task attempt not found: {attempt_id}")]
    AttemptNotFound { attempt_id: Uuid },

    /// Execution process not found
    #[error("Execution process not found: {process_id}")]
    ProcessNotFound { process_id: Uuid },

    /// Execution process already reached a terminal state
    #[error("Execution process {process_id} is not running")]
    ProcessNotRunning { process_id: Uuid },

    /// The executor action cannot be run as requested
    #[error("Invalid executor action: {message}")]
    InvalidAction { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn invalid_action(message: impl Into<String>) -> Self {
        Self::InvalidAction {
            message: message.into(),
        }
    }

    /// Whether this error means the caller referenced something that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AttemptNotFound { .. }
                | Self::ProcessNotFound { .. }
                | Self::ContainerNotFound { .. }
                | Self::Storage(conductor_core::Error::NotFound(_))
                | Self::Storage(conductor_core::Error::AttemptNotFound(_))
                | Self::Storage(conductor_core::Error::ExecutionNotFound(_))
        )
    }
}
