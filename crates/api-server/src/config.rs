//! Server configuration from `CONDUCTOR_*` environment variables
//!
//! Read once at startup. Invalid values are logged and replaced by the
//! default so a typo never prevents the server from starting.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent_runner::{ExecutionManagerConfig, MsgStoreLimits, DEFAULT_WORKTREE_TTL_HOURS};
use git_worktree::WorktreeConfig;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// JSON stores and per-execution logs
    pub data_dir: PathBuf,
    /// Repository worktrees are created from
    pub repo_path: PathBuf,
    /// Relative to `repo_path` unless absolute
    pub worktree_dir: PathBuf,
    pub branch_prefix: String,
    pub remote: String,
    pub bind: SocketAddr,
    pub worktree_ttl_hours: i64,
    pub cleanup_interval: Duration,
    pub kill_grace: Duration,
    pub log_history: MsgStoreLimits,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".conductor-data"),
            repo_path: PathBuf::from("."),
            worktree_dir: PathBuf::from(".worktrees"),
            branch_prefix: "attempt/".to_string(),
            remote: "origin".to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            worktree_ttl_hours: DEFAULT_WORKTREE_TTL_HOURS,
            cleanup_interval: Duration::from_secs(1800),
            kill_grace: agent_runner::DEFAULT_KILL_GRACE,
            log_history: MsgStoreLimits::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = Env(lookup);

        Self {
            data_dir: env.path("CONDUCTOR_DATA_DIR").unwrap_or(defaults.data_dir),
            repo_path: env.path("CONDUCTOR_REPO_PATH").unwrap_or(defaults.repo_path),
            worktree_dir: env.path("CONDUCTOR_WORKTREE_DIR").unwrap_or(defaults.worktree_dir),
            branch_prefix: env.string("CONDUCTOR_BRANCH_PREFIX").unwrap_or(defaults.branch_prefix),
            remote: env.string("CONDUCTOR_REMOTE").unwrap_or(defaults.remote),
            bind: env.parse("CONDUCTOR_BIND", defaults.bind),
            worktree_ttl_hours: env.parse("CONDUCTOR_WORKTREE_TTL_HOURS", defaults.worktree_ttl_hours),
            cleanup_interval: Duration::from_secs(env.parse(
                "CONDUCTOR_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )),
            kill_grace: Duration::from_secs(
                env.parse("CONDUCTOR_KILL_GRACE_SECS", defaults.kill_grace.as_secs()),
            ),
            log_history: MsgStoreLimits {
                max_bytes: env.parse(
                    "CONDUCTOR_LOG_HISTORY_MAX_BYTES",
                    defaults.log_history.max_bytes,
                ),
                max_entries: env.parse(
                    "CONDUCTOR_LOG_HISTORY_MAX_ENTRIES",
                    defaults.log_history.max_entries,
                ),
            },
        }
    }

    pub fn worktree_config(&self) -> WorktreeConfig {
        WorktreeConfig {
            worktree_dir: self.worktree_dir.clone(),
            remote: self.remote.clone(),
        }
    }

    pub fn execution_config(&self) -> ExecutionManagerConfig {
        ExecutionManagerConfig {
            kill_grace: self.kill_grace,
            worktree_ttl: chrono::Duration::hours(self.worktree_ttl_hours),
            msg_limits: self.log_history,
            ..Default::default()
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.string(key).map(PathBuf::from)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Invalid value {:?} for {}, using the default", raw, key);
                default
            }),
            None => default,
        }
    }
}
