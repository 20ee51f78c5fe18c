//! Git command execution utilities

use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace, warn};

use crate::error::{Result, WorktreeError};

/// Output from a git command
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Raw bytes of a diff, streamed as git produces them
pub type DiffStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Execute a git command in the specified directory
pub async fn git_command(repo_path: &Path, args: &[&str]) -> Result<GitOutput> {
    run_git(repo_path, args, None).await
}

fn git(repo_path: &Path, args: &[&str], index: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo_path);
    if let Some(index) = index {
        cmd.env("GIT_INDEX_FILE", index);
    }
    cmd
}

async fn run_git(repo_path: &Path, args: &[&str], index: Option<&Path>) -> Result<GitOutput> {
    debug!("Running git {:?} in {:?}", args, repo_path);

    let output = git(repo_path, args, index)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| WorktreeError::git_failed_with_source("Failed to execute git command", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    trace!("git stdout: {}", stdout);
    if !stderr.is_empty() {
        trace!("git stderr: {}", stderr);
    }

    Ok(GitOutput {
        stdout,
        stderr,
        success: output.status.success(),
    })
}

/// Execute a git command and return error if it fails
pub async fn git_command_checked(repo_path: &Path, args: &[&str]) -> Result<String> {
    checked(run_git(repo_path, args, None).await?, args)
}

/// Like [`git_command_checked`], against an alternate index file
pub async fn git_command_in_index(repo_path: &Path, index: &Path, args: &[&str]) -> Result<String> {
    checked(run_git(repo_path, args, Some(index)).await?, args)
}

fn checked(output: GitOutput, args: &[&str]) -> Result<String> {
    if !output.success {
        return Err(WorktreeError::git_failed(format!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Check if a path is inside a git repository
pub async fn is_git_repository(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let output = git_command(path, &["rev-parse", "--git-dir"]).await?;
    Ok(output.success)
}

/// Check if a local branch exists
pub async fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let output = git_command(
        repo_path,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)],
    )
    .await?;
    Ok(output.success)
}

/// Check if a remote-tracking branch exists
pub async fn remote_branch_exists(repo_path: &Path, remote: &str, branch: &str) -> Result<bool> {
    let output = git_command(
        repo_path,
        &[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/remotes/{}/{}", remote, branch),
        ],
    )
    .await?;
    Ok(output.success)
}

/// Check if a remote is configured
pub async fn has_remote(repo_path: &Path, remote: &str) -> Result<bool> {
    let output = git_command_checked(repo_path, &["remote"]).await?;
    Ok(output.lines().any(|line| line.trim() == remote))
}

/// Delete a local branch
pub async fn delete_branch(repo_path: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    git_command_checked(repo_path, &["branch", flag, branch]).await?;
    Ok(())
}

/// Fetch from remote
pub async fn fetch(repo_path: &Path, remote: &str) -> Result<()> {
    git_command_checked(repo_path, &["fetch", "--prune", remote]).await?;
    Ok(())
}

/// Run a git command against the temporary index at `index`, streaming its
/// stdout instead of buffering it. The index file is deleted once git exits.
pub async fn git_stream_in_index(repo_path: &Path, index: PathBuf, args: &[&str]) -> Result<DiffStream> {
    debug!("Streaming git {:?} in {:?}", args, repo_path);

    let mut child = match git(repo_path, args, Some(index.as_path()))
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            remove_index(&index).await;
            return Err(WorktreeError::git_failed_with_source("Failed to spawn git", e));
        }
    };

    let Some(stdout) = child.stdout.take() else {
        remove_index(&index).await;
        return Err(WorktreeError::git_failed("git stdout was not captured"));
    };

    // Reap the child once the output has been consumed
    let command = args.join(" ");
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => warn!("git {} exited with {}", command, status),
            Err(e) => warn!("Failed to wait for git {}: {}", command, e),
            _ => {}
        }
        remove_index(&index).await;
    });

    Ok(ReaderStream::new(stdout).boxed())
}

/// Delete a temporary index file
pub(crate) async fn remove_index(index: &Path) {
    if let Err(e) = tokio::fs::remove_file(index).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temporary index {:?}: {}", index, e);
        }
    }
}
