//! File-based executor session storage

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

use super::model::ExecutorSession;
use super::repository::ExecutorSessionRepository;
use crate::table::{JsonTable, Record};
use crate::{Error, Result};

impl Record for ExecutorSession {
    fn id(&self) -> Uuid {
        self.id
    }
}

pub struct FileSessionStore {
    table: JsonTable<ExecutorSession>,
}

impl FileSessionStore {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            table: JsonTable::open(path).await?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            table: JsonTable::in_memory(),
        }
    }

    async fn mutate(
        &self,
        execution_process_id: Uuid,
        f: impl FnOnce(&mut ExecutorSession),
    ) -> Result<()> {
        let mut cache = self.table.write().await;
        let session = cache
            .values_mut()
            .find(|s| s.execution_process_id == execution_process_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Executor session for execution {}",
                    execution_process_id
                ))
            })?;
        f(session);
        session.updated_at = Utc::now();
        self.table.persist(&cache).await
    }
}

#[async_trait]
impl ExecutorSessionRepository for FileSessionStore {
    async fn create(&self, session: ExecutorSession) -> Result<ExecutorSession> {
        let mut cache = self.table.write().await;
        if cache
            .values()
            .any(|s| s.execution_process_id == session.execution_process_id)
        {
            return Err(Error::InvalidInput(format!(
                "Execution {} already has a session",
                session.execution_process_id
            )));
        }
        cache.insert(session.id, session.clone());
        self.table.persist(&cache).await?;
        Ok(session)
    }

    async fn find_by_execution_process(
        &self,
        execution_process_id: Uuid,
    ) -> Result<Option<ExecutorSession>> {
        Ok(self
            .table
            .filter(|s| s.execution_process_id == execution_process_id)
            .await
            .into_iter()
            .next())
    }

    async fn update_session_id(&self, execution_process_id: Uuid, session_id: &str) -> Result<()> {
        self.mutate(execution_process_id, |s| {
            s.session_id = Some(session_id.to_string())
        })
        .await
    }

    async fn update_summary(&self, execution_process_id: Uuid, summary: &str) -> Result<()> {
        self.mutate(execution_process_id, |s| s.summary = Some(summary.to_string()))
            .await
    }
}
