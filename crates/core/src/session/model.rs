//! Executor session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSession {
    pub id: Uuid,
    pub task_attempt_id: Uuid,
    pub execution_process_id: Uuid,
    /// Id assigned by the agent, known once it announces it
    pub session_id: Option<String>,
    pub prompt: Option<String>,
    /// Final assistant message, used as the commit message when present
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutorSession {
    pub fn new(task_attempt_id: Uuid, execution_process_id: Uuid, prompt: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_attempt_id,
            execution_process_id,
            session_id: None,
            prompt,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}
