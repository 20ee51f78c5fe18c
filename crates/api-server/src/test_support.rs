//! Shared fixtures for route tests

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use agent_runner::{ExecutionManager, ExecutionManagerConfig, Repositories, WorktreeContainerService};
use axum::{
    body::{to_bytes, Body},
    http::Request,
    response::Response,
    Router,
};
use conductor_core::attempt::{FileAttemptStore, TaskAttempt};
use conductor_core::execution::{AgentKind, AgentProfile, FileExecutionStore};
use conductor_core::logs::JsonlLogStore;
use conductor_core::session::FileSessionStore;
use git_worktree::WorktreeManager;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::TempDir;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::routes;
use crate::state::AppState;

pub struct TestApp {
    pub state: AppState,
    _repo: TempDir,
    _data: TempDir,
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

impl TestApp {
    /// App over a fresh repository with one commit on `main`
    pub async fn new() -> Self {
        let repo = TempDir::new().unwrap();
        git(repo.path(), &["init", "-b", "main"]);
        git(repo.path(), &["config", "user.email", "test@test.com"]);
        git(repo.path(), &["config", "user.name", "Test"]);
        std::fs::write(repo.path().join("test.txt"), "test content\n").unwrap();
        git(repo.path(), &["add", "."]);
        git(repo.path(), &["commit", "-m", "Initial commit"]);

        let data = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: data.path().to_path_buf(),
            repo_path: repo.path().to_path_buf(),
            ..Default::default()
        };

        let attempts = Arc::new(FileAttemptStore::in_memory());
        let repos = Repositories {
            processes: Arc::new(FileExecutionStore::in_memory()),
            attempts: attempts.clone(),
            sessions: Arc::new(FileSessionStore::in_memory()),
            logs: Arc::new(JsonlLogStore::new(data.path())),
        };
        let worktrees = WorktreeManager::with_config(repo.path(), config.worktree_config())
            .await
            .unwrap();
        let container = Arc::new(WorktreeContainerService::new(
            worktrees,
            attempts,
            config.branch_prefix.clone(),
        ));
        let manager = ExecutionManager::new(
            ExecutionManagerConfig {
                kill_grace: std::time::Duration::from_millis(500),
                ..config.execution_config()
            },
            repos,
            container,
        );

        Self {
            state: AppState::from_parts(config, manager),
            _repo: repo,
            _data: data,
        }
    }

    pub fn router(&self) -> Router {
        routes::router().with_state(self.state.clone())
    }

    pub async fn attempt(&self, base_branch: &str) -> TaskAttempt {
        self.state
            .manager()
            .repositories()
            .attempts
            .create(TaskAttempt::new(
                Uuid::new_v4(),
                base_branch,
                AgentProfile::new(AgentKind::ClaudeCode),
            ))
            .await
            .unwrap()
    }

    pub async fn reload(&self, attempt_id: Uuid) -> TaskAttempt {
        self.state
            .manager()
            .repositories()
            .attempts
            .find_by_id(attempt_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Create the attempt's container and return its path
    pub async fn materialize(&self, attempt: &TaskAttempt) -> PathBuf {
        self.state.manager().container().ensure_exists(attempt).await.unwrap()
    }

    pub fn commit_in(&self, path: &Path) {
        git(path, &["add", "-A"]);
        git(path, &["commit", "-m", "Work in progress"]);
    }
}

pub fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(json) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn json_body<T: DeserializeOwned>(response: Response) -> T {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}
