//! JSON file-backed record table shared by the file stores.
//!
//! Records are cached in memory and the whole table is rewritten on every
//! mutation. A table without a path never touches disk.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::Result;

pub(crate) trait Record: Clone + Serialize + DeserializeOwned + Send + Sync {
    fn id(&self) -> Uuid;
}

pub(crate) struct JsonTable<T: Record> {
    path: Option<PathBuf>,
    cache: RwLock<HashMap<Uuid, T>>,
}

impl<T: Record> JsonTable<T> {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let records: Vec<T> = serde_json::from_str(&content)?;
            records.into_iter().map(|r| (r.id(), r)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: Some(path),
            cache: RwLock::new(cache),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<T> {
        self.cache.read().await.get(&id).cloned()
    }

    pub async fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.cache
            .read()
            .await
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, T>> {
        self.cache.write().await
    }

    /// Persist the cache to disk. Takes the guard so a mutation and its
    /// write-back are not interleaved with another writer.
    pub async fn persist(&self, cache: &HashMap<Uuid, T>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records: Vec<&T> = cache.values().collect();
        let content = serde_json::to_string_pretty(&records)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
