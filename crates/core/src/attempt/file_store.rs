//! File-based task attempt storage

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

use super::model::TaskAttempt;
use super::repository::TaskAttemptRepository;
use crate::table::{JsonTable, Record};
use crate::{Error, Result};

impl Record for TaskAttempt {
    fn id(&self) -> Uuid {
        self.id
    }
}

pub struct FileAttemptStore {
    table: JsonTable<TaskAttempt>,
}

impl FileAttemptStore {
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

    async fn mutate(&self, id: Uuid, f: impl FnOnce(&mut TaskAttempt)) -> Result<TaskAttempt> {
        let mut cache = self.table.write().await;
        let attempt = cache
            .get_mut(&id)
            .ok_or_else(|| Error::AttemptNotFound(id.to_string()))?;
        f(attempt);
        attempt.updated_at = Utc::now();
        let updated = attempt.clone();
        self.table.persist(&cache).await?;
        Ok(updated)
    }
}

#[async_trait]
impl TaskAttemptRepository for FileAttemptStore {
    async fn create(&self, attempt: TaskAttempt) -> Result<TaskAttempt> {
        let mut cache = self.table.write().await;
        if cache.contains_key(&attempt.id) {
            return Err(Error::InvalidInput(format!(
                "Task attempt with ID {} already exists",
                attempt.id
            )));
        }
        cache.insert(attempt.id, attempt.clone());
        self.table.persist(&cache).await?;
        Ok(attempt)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TaskAttempt>> {
        Ok(self.table.get(id).await)
    }

    async fn list(&self) -> Result<Vec<TaskAttempt>> {
        let mut attempts = self.table.filter(|_| true).await;
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }

    async fn update_container_ref(
        &self,
        id: Uuid,
        container_ref: &str,
        branch: &str,
    ) -> Result<TaskAttempt> {
        let mut cache = self.table.write().await;
        let taken = cache
            .values()
            .any(|a| a.id != id && a.container_ref.as_deref() == Some(container_ref));
        if taken {
            return Err(Error::InvalidInput(format!(
                "Container {} is already bound to another attempt",
                container_ref
            )));
        }

        let attempt = cache
            .get_mut(&id)
            .ok_or_else(|| Error::AttemptNotFound(id.to_string()))?;
        attempt.container_ref = Some(container_ref.to_string());
        attempt.branch = Some(branch.to_string());
        attempt.worktree_deleted = false;
        attempt.updated_at = Utc::now();
        let updated = attempt.clone();
        self.table.persist(&cache).await?;
        Ok(updated)
    }

    async fn mark_worktree_deleted(&self, id: Uuid) -> Result<()> {
        self.mutate(id, |attempt| attempt.worktree_deleted = true)
            .await
            .map(|_| ())
    }

    async fn mark_setup_completed(&self, id: Uuid) -> Result<()> {
        self.mutate(id, |attempt| attempt.setup_completed_at = Some(Utc::now()))
            .await
            .map(|_| ())
    }
}
