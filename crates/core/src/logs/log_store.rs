//! Durable per-execution logs
//!
//! Directory structure:
//! ```text
//! <data_dir>/
//!   executions/
//!     {execution_id}/
//!       logs.jsonl   # one LogMsg per line, append-only
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::log_msg::LogMsg;
use crate::parse::Parsed;
use crate::Result;

#[async_trait]
pub trait ExecutionLogRepository: Send + Sync {
    /// Append one message to the execution's log
    async fn append(&self, execution_id: Uuid, msg: &LogMsg) -> Result<()>;

    /// Replace the whole log with the given messages
    async fn overwrite(&self, execution_id: Uuid, msgs: &[LogMsg]) -> Result<()>;

    /// Load the log in order. Unreadable lines are skipped.
    async fn load(&self, execution_id: Uuid) -> Result<Vec<LogMsg>>;
}

/// Newline-delimited JSON log files under a data directory
#[derive(Debug, Clone)]
pub struct JsonlLogStore {
    base_dir: PathBuf,
}

impl JsonlLogStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("executions"),
        }
    }

    fn log_path(&self, execution_id: Uuid) -> PathBuf {
        self.base_dir
            .join(execution_id.to_string())
            .join("logs.jsonl")
    }

    async fn ensure_dir(&self, execution_id: Uuid) -> Result<PathBuf> {
        let path = self.log_path(execution_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

fn encode(msgs: &[LogMsg]) -> Result<String> {
    let mut out = String::new();
    for msg in msgs {
        out.push_str(&serde_json::to_string(msg)?);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl ExecutionLogRepository for JsonlLogStore {
    async fn append(&self, execution_id: Uuid, msg: &LogMsg) -> Result<()> {
        let path = self.ensure_dir(execution_id).await?;
        let line = encode(std::slice::from_ref(msg))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn overwrite(&self, execution_id: Uuid, msgs: &[LogMsg]) -> Result<()> {
        let path = self.ensure_dir(execution_id).await?;
        fs::write(&path, encode(msgs)?).await?;
        debug!("Rewrote {} log lines to {}", msgs.len(), path.display());
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Vec<LogMsg>> {
        let path = self.log_path(execution_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let mut msgs = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Parsed::<LogMsg>::from_json(line) {
                Parsed::Parsed(msg) => msgs.push(msg),
                Parsed::Raw(_) => {
                    warn!(
                        "Skipping unreadable log line {} in {}",
                        line_num,
                        path.display()
                    );
                }
            }
        }

        Ok(msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{ConversationPatch, NormalizedEntry};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_load_in_order() {
        let temp = TempDir::new().unwrap();
        let store = JsonlLogStore::new(temp.path());
        let id = Uuid::new_v4();

        let msgs = vec![
            LogMsg::Stdout("one\n".into()),
            LogMsg::Stderr("two\n".into()),
            LogMsg::JsonPatch(ConversationPatch::add_normalized_entry(
                0,
                NormalizedEntry::system("three"),
            )),
            LogMsg::SessionId("s-1".into()),
            LogMsg::Finished,
        ];
        for msg in &msgs {
            store.append(id, msg).await.unwrap();
        }

        assert_eq!(store.load(id).await.unwrap(), msgs);
    }

    #[tokio::test]
    async fn test_load_skips_bad_lines() {
        let temp = TempDir::new().unwrap();
        let store = JsonlLogStore::new(temp.path());
        let id = Uuid::new_v4();

        store.append(id, &LogMsg::Stdout("ok\n".into())).await.unwrap();
        let path = store.log_path(id);
        let mut content = fs::read_to_string(&path).await.unwrap();
        content.push_str("{not json\n\n");
        fs::write(&path, content).await.unwrap();
        store.append(id, &LogMsg::Finished).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded, vec![LogMsg::Stdout("ok\n".into()), LogMsg::Finished]);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_log() {
        let temp = TempDir::new().unwrap();
        let store = JsonlLogStore::new(temp.path());
        let id = Uuid::new_v4();

        store.append(id, &LogMsg::Stdout("old\n".into())).await.unwrap();
        store
            .overwrite(id, &[LogMsg::Stdout("new\n".into())])
            .await
            .unwrap();

        assert_eq!(store.load(id).await.unwrap(), vec![LogMsg::Stdout("new\n".into())]);
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonlLogStore::new(temp.path());
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
