//! Executor session repository trait

use async_trait::async_trait;
use uuid::Uuid;

use super::model::ExecutorSession;
use crate::Result;

#[async_trait]
pub trait ExecutorSessionRepository: Send + Sync {
    async fn create(&self, session: ExecutorSession) -> Result<ExecutorSession>;

    async fn find_by_execution_process(
        &self,
        execution_process_id: Uuid,
    ) -> Result<Option<ExecutorSession>>;

    async fn update_session_id(&self, execution_process_id: Uuid, session_id: &str) -> Result<()>;

    async fn update_summary(&self, execution_process_id: Uuid, summary: &str) -> Result<()>;
}
