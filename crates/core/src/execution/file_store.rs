//! File-based execution process storage

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

use super::model::{ExecutionProcess, ExecutionProcessStatus};
use super::repository::ExecutionProcessRepository;
use crate::table::{JsonTable, Record};
use crate::{Error, Result};

impl Record for ExecutionProcess {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Execution processes stored as a JSON array on disk
pub struct FileExecutionStore {
    table: JsonTable<ExecutionProcess>,
}

impl FileExecutionStore {
    /// Open the store, loading existing records if the file exists
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            table: JsonTable::open(path).await?,
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            table: JsonTable::in_memory(),
        }
    }
}

#[async_trait]
impl ExecutionProcessRepository for FileExecutionStore {
    async fn create(&self, process: ExecutionProcess) -> Result<ExecutionProcess> {
        let mut cache = self.table.write().await;
        if cache.contains_key(&process.id) {
            return Err(Error::InvalidInput(format!(
                "Execution process with ID {} already exists",
                process.id
            )));
        }
        cache.insert(process.id, process.clone());
        self.table.persist(&cache).await?;
        Ok(process)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ExecutionProcess>> {
        Ok(self.table.get(id).await)
    }

    async fn find_by_task_attempt(&self, task_attempt_id: Uuid) -> Result<Vec<ExecutionProcess>> {
        let mut processes = self
            .table
            .filter(|p| p.task_attempt_id == task_attempt_id)
            .await;
        processes.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(processes)
    }

    async fn find_running(&self) -> Result<Vec<ExecutionProcess>> {
        Ok(self.table.filter(|p| p.is_running()).await)
    }

    async fn update_completion(
        &self,
        id: Uuid,
        status: ExecutionProcessStatus,
        exit_code: Option<i64>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(
                "Completion status must be terminal".to_string(),
            ));
        }

        let mut cache = self.table.write().await;
        let process = cache
            .get_mut(&id)
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;

        if process.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        process.status = status;
        process.exit_code = exit_code;
        process.completed_at = Some(now);
        process.updated_at = now;

        self.table.persist(&cache).await?;
        Ok(true)
    }
}
