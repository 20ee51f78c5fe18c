//! Task attempt model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::AgentProfile;

/// One isolated unit of agent work. The container is created lazily on the
/// first execution, so `container_ref` starts out empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    pub container_ref: Option<String>,
    pub branch: Option<String>,
    pub base_branch: String,
    pub profile: AgentProfile,
    pub worktree_deleted: bool,
    pub setup_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskAttempt {
    pub fn new(task_id: Uuid, base_branch: impl Into<String>, profile: AgentProfile) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            container_ref: None,
            branch: None,
            base_branch: base_branch.into(),
            profile,
            worktree_deleted: false,
            setup_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Use a specific branch name instead of a generated one
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Short, branch-safe identifier derived from the attempt id
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}
