//! Worktree management

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::commands::{
    branch_exists, delete_branch, fetch, git_command, git_command_checked, git_command_in_index,
    git_stream_in_index, has_remote, is_git_repository, remote_branch_exists, remove_index,
    DiffStream,
};
use crate::error::{Result, WorktreeError};

/// Status of a worktree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    /// Worktree is active and usable
    Active,
    /// Worktree is locked
    Locked,
    /// Worktree directory is gone, metadata is stale
    Prunable,
}

/// Represents a Git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Absolute path to the worktree
    pub path: PathBuf,
    /// Branch name associated with this worktree
    pub branch: String,
    /// Commit hash at the HEAD of this worktree
    pub head: String,
    /// Status of the worktree
    pub status: WorktreeStatus,
    /// Whether this is the main worktree
    pub is_main: bool,
}

/// Configuration for WorktreeManager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Directory where worktrees will be created, relative to the repository
    /// unless absolute
    pub worktree_dir: PathBuf,
    /// Remote consulted for base branches
    pub remote: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from(".worktrees"),
            remote: "origin".to_string(),
        }
    }
}

/// Where a new branch starts from
#[derive(Debug, Clone, PartialEq, Eq)]
struct BaseRef {
    rev: String,
    remote: bool,
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| WorktreeError::InvalidPath {
        path: path.to_path_buf(),
    })
}

/// Directory name for a branch: path separators are flattened
fn dir_name_for_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '-',
            c => c,
        })
        .collect()
}

/// A fresh index file path inside the worktree's private git directory
async fn temp_index_path(worktree_path: &Path) -> Result<PathBuf> {
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let index = git_command_checked(worktree_path, &["rev-parse", "--git-path", "index"]).await?;
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    Ok(worktree_path.join(format!("{}.diff-{}-{}", index.trim(), std::process::id(), n)))
}

async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Manages Git worktrees for attempt isolation
#[derive(Debug)]
pub struct WorktreeManager {
    /// Path to the main repository
    repo_path: PathBuf,
    /// Configuration
    config: WorktreeConfig,
}

impl WorktreeManager {
    /// Create a new WorktreeManager for the given repository
    pub async fn new(repo_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(repo_path, WorktreeConfig::default()).await
    }

    /// Create a new WorktreeManager with custom configuration
    pub async fn with_config(
        repo_path: impl Into<PathBuf>,
        config: WorktreeConfig,
    ) -> Result<Self> {
        let repo_path = repo_path.into();

        if !is_git_repository(&repo_path).await? {
            return Err(WorktreeError::NotAGitRepository {
                path: repo_path.clone(),
            });
        }

        Ok(Self { repo_path, config })
    }

    /// Get the repository path
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Get the worktree directory
    pub fn worktree_dir(&self) -> PathBuf {
        self.repo_path.join(&self.config.worktree_dir)
    }

    /// Path a worktree for `branch` is materialized at
    pub fn path_for_branch(&self, branch: &str) -> PathBuf {
        self.worktree_dir().join(dir_name_for_branch(branch))
    }

    /// Fetch remote refs. Offline or remote-less repositories are fine.
    async fn refresh_remote(&self) {
        match has_remote(&self.repo_path, &self.config.remote).await {
            Ok(true) => {
                if let Err(e) = fetch(&self.repo_path, &self.config.remote).await {
                    warn!("Fetch from {} failed, using cached refs: {}", self.config.remote, e);
                }
            }
            Ok(false) => debug!("No remote {} configured, skipping fetch", self.config.remote),
            Err(e) => warn!("Could not list remotes: {}", e),
        }
    }

    /// Resolve the base branch, preferring the remote-qualified ref
    async fn resolve_base(&self, base_branch: &str) -> Result<BaseRef> {
        let remote = &self.config.remote;
        if remote_branch_exists(&self.repo_path, remote, base_branch).await? {
            return Ok(BaseRef {
                rev: format!("{}/{}", remote, base_branch),
                remote: true,
            });
        }
        if branch_exists(&self.repo_path, base_branch).await? {
            return Ok(BaseRef {
                rev: base_branch.to_string(),
                remote: false,
            });
        }
        Err(WorktreeError::BranchNotFound {
            branch: base_branch.to_string(),
        })
    }

    /// Create a new branch from `base_branch` and a worktree for it.
    ///
    /// Remote refs are fetched first. When the base exists at the remote the
    /// new branch starts from, and tracks, the remote branch.
    pub async fn create(&self, branch: &str, base_branch: &str) -> Result<Worktree> {
        if branch_exists(&self.repo_path, branch).await? {
            return Err(WorktreeError::BranchExists {
                branch: branch.to_string(),
            });
        }

        let worktree_path = self.path_for_branch(branch);
        if worktree_path.exists() {
            return Err(WorktreeError::WorktreeExists {
                path: worktree_path,
            });
        }

        self.refresh_remote().await;
        let base = self.resolve_base(base_branch).await?;

        tokio::fs::create_dir_all(self.worktree_dir()).await?;

        info!(
            "Creating worktree at {:?} on {} from {}",
            worktree_path, branch, base.rev
        );

        let path = path_arg(&worktree_path)?;
        let mut args = vec!["worktree", "add"];
        if base.remote {
            args.push("--track");
        }
        args.extend(["-b", branch, path, base.rev.as_str()]);
        git_command_checked(&self.repo_path, &args).await?;

        self.describe(worktree_path, branch).await
    }

    /// Return the worktree for `branch`, materializing it if needed.
    ///
    /// An existing, registered directory is reused as is. A branch that
    /// survived an earlier removal is checked out again instead of being
    /// recreated from the base.
    pub async fn ensure(&self, branch: &str, base_branch: &str) -> Result<Worktree> {
        let worktree_path = self.path_for_branch(branch);

        if worktree_path.exists() {
            if let Some(existing) = self.get(&worktree_path).await? {
                if existing.status == WorktreeStatus::Active {
                    debug!("Reusing worktree at {:?}", worktree_path);
                    return Ok(existing);
                }
            }
            warn!(
                "Directory {:?} is not a usable worktree, recreating",
                worktree_path
            );
            self.remove(&worktree_path, false).await?;
        }

        // Drop metadata of a worktree whose directory vanished
        self.prune().await?;

        if branch_exists(&self.repo_path, branch).await? {
            tokio::fs::create_dir_all(self.worktree_dir()).await?;
            info!("Re-attaching branch {} at {:?}", branch, worktree_path);
            let path = path_arg(&worktree_path)?;
            git_command_checked(&self.repo_path, &["worktree", "add", path, branch]).await?;
            return self.describe(worktree_path, branch).await;
        }

        self.create(branch, base_branch).await
    }

    async fn describe(&self, path: PathBuf, branch: &str) -> Result<Worktree> {
        let head = git_command_checked(&path, &["rev-parse", "HEAD"]).await?;
        Ok(Worktree {
            path,
            branch: branch.to_string(),
            head: head.trim().to_string(),
            status: WorktreeStatus::Active,
            is_main: false,
        })
    }

    /// List all worktrees
    pub async fn list(&self) -> Result<Vec<Worktree>> {
        let output =
            git_command_checked(&self.repo_path, &["worktree", "list", "--porcelain"]).await?;

        let mut worktrees = Vec::new();
        let mut current_worktree: Option<Worktree> = None;

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(wt) = current_worktree.take() {
                    worktrees.push(wt);
                }
                current_worktree = Some(Worktree {
                    path: PathBuf::from(path),
                    branch: String::new(),
                    head: String::new(),
                    status: WorktreeStatus::Active,
                    is_main: false,
                });
            } else if let Some(ref mut wt) = current_worktree {
                if let Some(head) = line.strip_prefix("HEAD ") {
                    wt.head = head.to_string();
                } else if let Some(branch) = line.strip_prefix("branch ") {
                    wt.branch = branch.trim_start_matches("refs/heads/").to_string();
                } else if line == "bare" {
                    wt.is_main = true;
                } else if line.starts_with("locked") {
                    wt.status = WorktreeStatus::Locked;
                } else if line.starts_with("prunable") {
                    wt.status = WorktreeStatus::Prunable;
                }
            }
        }

        if let Some(wt) = current_worktree {
            worktrees.push(wt);
        }

        // The first entry is always the primary working directory
        if let Some(first) = worktrees.first_mut() {
            first.is_main = true;
        }

        Ok(worktrees)
    }

    /// Get a specific worktree by path
    pub async fn get(&self, path: &Path) -> Result<Option<Worktree>> {
        let wanted = canonical(path).await;
        for wt in self.list().await? {
            if wt.path == path || canonical(&wt.path).await == wanted {
                return Ok(Some(wt));
            }
        }
        Ok(None)
    }

    /// Remove a worktree in two phases.
    ///
    /// First `git worktree remove --force`; if that fails the directory is
    /// deleted from the filesystem and stale metadata pruned. Errors only if
    /// the directory is still present afterwards.
    pub async fn remove(&self, path: &Path, delete_branch_flag: bool) -> Result<()> {
        let registered = self.get(path).await?;
        if registered.as_ref().is_some_and(|wt| wt.is_main) {
            return Err(WorktreeError::git_failed("Cannot remove the main worktree"));
        }

        info!("Removing worktree at {:?}", path);

        let clean = match path_arg(path) {
            Ok(arg) => git_command(&self.repo_path, &["worktree", "remove", "--force", arg])
                .await
                .map(|out| out.success)
                .unwrap_or(false),
            Err(_) => false,
        };

        if !clean {
            warn!("git worktree remove failed for {:?}, deleting directly", path);
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            self.prune().await?;
        }

        if path.exists() {
            return Err(WorktreeError::RemoveFailed {
                path: path.to_path_buf(),
            });
        }

        if delete_branch_flag {
            if let Some(branch) = registered.map(|wt| wt.branch).filter(|b| !b.is_empty()) {
                debug!("Deleting branch {}", branch);
                if let Err(e) = delete_branch(&self.repo_path, &branch, true).await {
                    warn!("Failed to delete branch {}: {}", branch, e);
                }
            }
        }

        Ok(())
    }

    /// Prune stale worktree information
    pub async fn prune(&self) -> Result<()> {
        git_command_checked(&self.repo_path, &["worktree", "prune"]).await?;
        Ok(())
    }

    /// Delete directories under the worktree dir that git does not know
    /// about, then prune.
    ///
    /// # Returns
    /// Number of directories removed
    pub async fn cleanup_orphan_dirs(&self) -> Result<usize> {
        let worktree_dir = self.worktree_dir();
        if !worktree_dir.exists() {
            return Ok(0);
        }

        let mut known = HashSet::new();
        for wt in self.list().await? {
            known.insert(canonical(&wt.path).await);
        }

        let mut cleaned = 0;
        let mut entries = tokio::fs::read_dir(&worktree_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() || known.contains(&canonical(&path).await) {
                continue;
            }
            info!("Removing orphaned worktree directory {:?}", path);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("Failed to remove orphaned directory {:?}: {}", path, e),
            }
        }

        self.prune().await?;
        Ok(cleaned)
    }

    /// Check if there are uncommitted changes in a worktree
    pub async fn has_uncommitted_changes(&self, worktree_path: &Path) -> Result<bool> {
        let output = git_command_checked(worktree_path, &["status", "--porcelain"]).await?;
        Ok(!output.trim().is_empty())
    }

    /// Stream the diff of a worktree against the point it forked from its
    /// base branch. Committed, uncommitted and untracked changes are
    /// included; commits made on the base since then are not.
    ///
    /// The working tree is staged into a throwaway index, so the worktree's
    /// own index is left alone.
    pub async fn diff_against_base(
        &self,
        worktree_path: &Path,
        base_branch: &str,
    ) -> Result<DiffStream> {
        let base = self.resolve_base(base_branch).await?;
        let fork_point =
            git_command_checked(worktree_path, &["merge-base", base.rev.as_str(), "HEAD"]).await?;
        let fork_point = fork_point.trim().to_string();

        let index = temp_index_path(worktree_path).await?;
        let staged = async {
            git_command_in_index(worktree_path, &index, &["read-tree", "HEAD"]).await?;
            git_command_in_index(worktree_path, &index, &["add", "-A"]).await
        }
        .await;
        if let Err(e) = staged {
            remove_index(&index).await;
            return Err(e);
        }

        git_stream_in_index(
            worktree_path,
            index,
            &["diff", "--cached", "--no-color", fork_point.as_str()],
        )
        .await
    }

    /// Stage and commit everything in a worktree.
    ///
    /// Returns the new commit hash, or `None` when there was nothing to
    /// commit.
    pub async fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        if !self.has_uncommitted_changes(worktree_path).await? {
            return Ok(None);
        }

        git_command_checked(worktree_path, &["add", "-A"]).await?;
        git_command_checked(worktree_path, &["commit", "-m", message]).await?;

        let output = git_command_checked(worktree_path, &["rev-parse", "HEAD"]).await?;
        Ok(Some(output.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::init_test_repo;
    use futures::StreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_worktree_manager() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();
        assert_eq!(manager.repo_path(), dir.path());
    }

    #[tokio::test]
    async fn test_create_worktree_manager_not_git_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path()).await;
        assert!(matches!(
            result,
            Err(WorktreeError::NotAGitRepository { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_and_list_worktree() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        let worktree = manager.create("attempt/abc", "main").await.unwrap();
        assert!(worktree.path.exists());
        assert!(worktree.path.ends_with("attempt-abc"));
        assert_eq!(worktree.branch, "attempt/abc");
        assert!(!worktree.is_main);

        let worktrees = manager.list().await.unwrap();
        assert!(worktrees.len() >= 2);
        assert!(worktrees.iter().any(|wt| wt.branch == "attempt/abc"));
    }

    #[tokio::test]
    async fn test_create_duplicate_branch() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        manager.create("task-1", "main").await.unwrap();
        let result = manager.create("task-1", "main").await;
        assert!(matches!(result, Err(WorktreeError::BranchExists { .. })));
    }

    #[tokio::test]
    async fn test_create_missing_base_branch() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        let result = manager.create("task-2", "does-not-exist").await;
        assert!(matches!(result, Err(WorktreeError::BranchNotFound { .. })));
        assert!(!manager.path_for_branch("task-2").exists());
    }

    #[tokio::test]
    async fn test_create_from_remote_only_base() {
        let upstream = init_test_repo().await;
        let clone_parent = TempDir::new().unwrap();
        let clone_path = clone_parent.path().join("clone");
        git_command_checked(
            clone_parent.path(),
            &["clone", upstream.path().to_str().unwrap(), "clone"],
        )
        .await
        .unwrap();

        // Leave `main` only at the remote
        git_command_checked(&clone_path, &["checkout", "-b", "scratch"])
            .await
            .unwrap();
        git_command_checked(&clone_path, &["branch", "-D", "main"])
            .await
            .unwrap();
        assert!(!branch_exists(&clone_path, "main").await.unwrap());

        let manager = WorktreeManager::new(&clone_path).await.unwrap();
        let worktree = manager.create("task-abc", "main").await.unwrap();
        assert!(worktree.path.join("test.txt").exists());
        assert!(branch_exists(&clone_path, "task-abc").await.unwrap());

        let upstream_ref = git_command_checked(
            &clone_path,
            &["rev-parse", "--abbrev-ref", "task-abc@{upstream}"],
        )
        .await
        .unwrap();
        assert_eq!(upstream_ref.trim(), "origin/main");
    }

    #[tokio::test]
    async fn test_ensure_reuses_and_reattaches() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        let first = manager.ensure("task-e", "main").await.unwrap();
        tokio::fs::write(first.path.join("marker.txt"), "keep").await.unwrap();

        let second = manager.ensure("task-e", "main").await.unwrap();
        assert_eq!(canonical(&first.path).await, canonical(&second.path).await);
        assert!(second.path.join("marker.txt").exists());

        // Directory removed behind git's back: the branch is checked out again
        tokio::fs::remove_dir_all(&first.path).await.unwrap();
        let third = manager.ensure("task-e", "main").await.unwrap();
        assert!(third.path.exists());
        assert_eq!(third.branch, "task-e");
    }

    #[tokio::test]
    async fn test_remove_worktree() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        let worktree = manager.create("task-r", "main").await.unwrap();
        let path = worktree.path.clone();

        // Dirty worktrees are removed too
        tokio::fs::write(path.join("dirty.txt"), "x").await.unwrap();
        manager.remove(&path, true).await.unwrap();
        assert!(!path.exists());
        assert!(!branch_exists(dir.path(), "task-r").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_unregistered_directory_falls_back() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        let stray = manager.worktree_dir().join("stray");
        tokio::fs::create_dir_all(stray.join("nested")).await.unwrap();
        manager.remove(&stray, false).await.unwrap();
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn test_cleanup_orphan_dirs() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();

        let kept = manager.create("task-keep", "main").await.unwrap();
        let orphan = manager.worktree_dir().join("orphan");
        tokio::fs::create_dir_all(&orphan).await.unwrap();

        let cleaned = manager.cleanup_orphan_dirs().await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(!orphan.exists());
        assert!(kept.path.exists());
    }

    #[tokio::test]
    async fn test_commit_all_and_diff() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();
        let worktree = manager.create("task-c", "main").await.unwrap();

        assert!(!manager.has_uncommitted_changes(&worktree.path).await.unwrap());
        assert_eq!(manager.commit_all(&worktree.path, "noop").await.unwrap(), None);

        tokio::fs::write(worktree.path.join("test.txt"), "changed\n")
            .await
            .unwrap();
        assert!(manager.has_uncommitted_changes(&worktree.path).await.unwrap());

        let hash = manager
            .commit_all(&worktree.path, "Agent changes")
            .await
            .unwrap();
        assert!(hash.is_some());
        assert!(!manager.has_uncommitted_changes(&worktree.path).await.unwrap());

        let mut stream = manager
            .diff_against_base(&worktree.path, "main")
            .await
            .unwrap();
        let mut diff = Vec::new();
        while let Some(chunk) = stream.next().await {
            diff.extend_from_slice(&chunk.unwrap());
        }
        let diff = String::from_utf8(diff).unwrap();
        assert!(diff.contains("-test content"));
        assert!(diff.contains("+changed"));
    }

    async fn collect(mut stream: DiffStream) -> String {
        let mut diff = Vec::new();
        while let Some(chunk) = stream.next().await {
            diff.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(diff).unwrap()
    }

    #[tokio::test]
    async fn test_diff_includes_untracked_and_skips_base_drift() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new(dir.path()).await.unwrap();
        let worktree = manager.create("task-d", "main").await.unwrap();

        // Moves main on after the fork
        tokio::fs::write(dir.path().join("upstream.txt"), "later\n")
            .await
            .unwrap();
        git_command_checked(dir.path(), &["add", "upstream.txt"]).await.unwrap();
        git_command_checked(dir.path(), &["commit", "-m", "Upstream work"])
            .await
            .unwrap();

        tokio::fs::write(worktree.path.join("notes.md"), "draft\n")
            .await
            .unwrap();

        let diff = collect(
            manager
                .diff_against_base(&worktree.path, "main")
                .await
                .unwrap(),
        )
        .await;
        assert!(diff.contains("notes.md"));
        assert!(diff.contains("+draft"));
        assert!(!diff.contains("upstream.txt"));

        // The worktree's own index is untouched
        let status = git_command_checked(&worktree.path, &["status", "--porcelain"])
            .await
            .unwrap();
        assert_eq!(status.trim(), "?? notes.md");
    }
}
