//! Application state

use std::sync::Arc;

use agent_runner::{ExecutionManager, Repositories, WorktreeContainerService};
use conductor_core::attempt::FileAttemptStore;
use conductor_core::execution::FileExecutionStore;
use conductor_core::logs::JsonlLogStore;
use conductor_core::session::FileSessionStore;
use git_worktree::WorktreeManager;

use crate::config::AppConfig;

/// Shared application state, the one context every handler receives
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    manager: ExecutionManager,
}

impl AppState {
    /// Open the file stores under the data directory and wire the manager
    pub async fn new(config: AppConfig) -> agent_runner::Result<Self> {
        let data_dir = &config.data_dir;
        tokio::fs::create_dir_all(data_dir).await?;

        let attempts = Arc::new(FileAttemptStore::new(data_dir.join("attempts.json")).await?);
        let repos = Repositories {
            processes: Arc::new(FileExecutionStore::new(data_dir.join("executions.json")).await?),
            attempts: attempts.clone(),
            sessions: Arc::new(FileSessionStore::new(data_dir.join("sessions.json")).await?),
            logs: Arc::new(JsonlLogStore::new(data_dir)),
        };

        let worktrees = WorktreeManager::with_config(&config.repo_path, config.worktree_config()).await?;
        let container = Arc::new(WorktreeContainerService::new(
            worktrees,
            attempts,
            config.branch_prefix.clone(),
        ));
        let manager = ExecutionManager::new(config.execution_config(), repos, container);

        Ok(Self::from_parts(config, manager))
    }

    pub fn from_parts(config: AppConfig, manager: ExecutionManager) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, manager }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.inner.manager
    }
}
