//! Execution process model definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::ExecutorAction;

/// Why an execution process was started. Governs completion and
/// auto-commit semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    SetupScript,
    CleanupScript,
    CodingAgent,
    DevServer,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupScript => "setup_script",
            Self::CleanupScript => "cleanup_script",
            Self::CodingAgent => "coding_agent",
            Self::DevServer => "dev_server",
        }
    }

    /// Whether changes left in the container are committed once the
    /// process finishes.
    pub fn commits_on_completion(&self) -> bool {
        matches!(self, Self::CodingAgent | Self::CleanupScript)
    }
}

impl std::fmt::Display for RunReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ExecutionProcessStatus {
    /// `Running` is the only non-terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

/// Exit code recorded when an execution is stopped on request (128 + SIGTERM).
pub const KILLED_EXIT_CODE: i64 = 143;

/// One tracked invocation within a task attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProcess {
    pub id: Uuid,
    pub task_attempt_id: Uuid,
    pub run_reason: RunReason,
    pub executor_action: ExecutorAction,
    pub status: ExecutionProcessStatus,
    pub exit_code: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionProcess {
    /// Create a new process record in the `running` state
    pub fn new(task_attempt_id: Uuid, run_reason: RunReason, executor_action: ExecutorAction) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_attempt_id,
            run_reason,
            executor_action,
            status: ExecutionProcessStatus::Running,
            exit_code: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionProcessStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutorActionType, ScriptContext, ScriptLanguage};

    #[test]
    fn test_commit_on_completion_run_reasons() {
        assert!(RunReason::CodingAgent.commits_on_completion());
        assert!(RunReason::CleanupScript.commits_on_completion());
        assert!(!RunReason::SetupScript.commits_on_completion());
        assert!(!RunReason::DevServer.commits_on_completion());
    }

    #[test]
    fn test_new_process_is_running() {
        let action = ExecutorAction::new(ExecutorActionType::Script {
            script: "npm run dev".to_string(),
            language: ScriptLanguage::Bash,
            context: ScriptContext::DevServer,
        });
        let process = ExecutionProcess::new(Uuid::new_v4(), RunReason::DevServer, action);
        assert!(process.is_running());
        assert!(process.exit_code.is_none());
        assert!(process.completed_at.is_none());
        assert!(!process.status.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionProcessStatus::Killed).unwrap();
        assert_eq!(json, "\"killed\"");
        let reason: RunReason = serde_json::from_str("\"cleanup_script\"").unwrap();
        assert_eq!(reason, RunReason::CleanupScript);
    }
}
