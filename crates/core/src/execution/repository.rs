//! Execution process repository trait
//!
//! Defines the storage operations the execution lifecycle depends on.

use async_trait::async_trait;
use uuid::Uuid;

use super::model::{ExecutionProcess, ExecutionProcessStatus};
use crate::Result;

#[async_trait]
pub trait ExecutionProcessRepository: Send + Sync {
    /// Create a new process record
    async fn create(&self, process: ExecutionProcess) -> Result<ExecutionProcess>;

    /// Get a process by ID
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExecutionProcess>>;

    /// All processes of an attempt, oldest first
    async fn find_by_task_attempt(&self, task_attempt_id: Uuid) -> Result<Vec<ExecutionProcess>>;

    /// All processes that are still `running`
    async fn find_running(&self) -> Result<Vec<ExecutionProcess>>;

    /// Record the transition out of `running`.
    ///
    /// Returns `false` without touching the record when it is already
    /// terminal: the first terminal write wins.
    async fn update_completion(
        &self,
        id: Uuid,
        status: ExecutionProcessStatus,
        exit_code: Option<i64>,
    ) -> Result<bool>;
}
