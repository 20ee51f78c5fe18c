//! End-to-end execution lifecycle against a real repository, real `sh`
//! processes and file-backed stores.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use agent_runner::{
    ContainerService, ExecutionManager, ExecutionManagerConfig, ExecutorError, LifecycleEvent,
    MsgStoreLimits, Repositories, WorktreeContainerService,
};
use async_trait::async_trait;
use conductor_core::attempt::{FileAttemptStore, TaskAttempt, TaskAttemptRepository};
use conductor_core::execution::{
    AgentKind, AgentProfile, ExecutionProcessRepository, ExecutionProcessStatus, ExecutorAction,
    ExecutorActionType, FileExecutionStore, RunReason, ScriptContext, ScriptLanguage,
    KILLED_EXIT_CODE,
};
use conductor_core::logs::{ExecutionLogRepository, JsonlLogStore, LogMsg, NormalizedEntry, PatchValue};
use conductor_core::session::{ExecutorSessionRepository, FileSessionStore};
use futures::StreamExt;
use git_worktree::{DiffStream, WorktreeManager};
use tempfile::TempDir;
use tokio::sync::broadcast;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(20);

struct Harness {
    _repo: TempDir,
    data: TempDir,
    manager: ExecutionManager,
    attempts: Arc<FileAttemptStore>,
    processes: Arc<FileExecutionStore>,
    sessions: Arc<FileSessionStore>,
    logs: Arc<JsonlLogStore>,
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(output.status.success(), "git {:?} failed", args);
    String::from_utf8(output.stdout).unwrap()
}

fn init_test_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("test.txt"), "test content\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "Initial commit"]);
    dir
}

async fn harness_with(config: ExecutionManagerConfig) -> Harness {
    harness_wrapping(config, |container| container).await
}

/// Harness whose container service is `wrap` applied to the worktree backend
async fn harness_wrapping(
    config: ExecutionManagerConfig,
    wrap: impl FnOnce(Arc<dyn ContainerService>) -> Arc<dyn ContainerService>,
) -> Harness {
    let repo = init_test_repo();
    let data = TempDir::new().unwrap();
    let attempts = Arc::new(FileAttemptStore::in_memory());
    let processes = Arc::new(FileExecutionStore::in_memory());
    let sessions = Arc::new(FileSessionStore::in_memory());
    let logs = Arc::new(JsonlLogStore::new(data.path()));

    let worktrees = WorktreeManager::new(repo.path()).await.unwrap();
    let container: Arc<dyn ContainerService> = Arc::new(WorktreeContainerService::new(
        worktrees,
        attempts.clone(),
        "attempt/",
    ));
    let container = wrap(container);
    let repos = Repositories {
        processes: processes.clone(),
        attempts: attempts.clone(),
        sessions: sessions.clone(),
        logs: logs.clone(),
    };
    let manager = ExecutionManager::new(config, repos, container);

    Harness {
        _repo: repo,
        data,
        manager,
        attempts,
        processes,
        sessions,
        logs,
    }
}

async fn harness() -> Harness {
    harness_with(ExecutionManagerConfig {
        kill_grace: Duration::from_millis(500),
        ..Default::default()
    })
    .await
}

impl Harness {
    async fn attempt(&self, base_branch: &str) -> TaskAttempt {
        self.attempts
            .create(TaskAttempt::new(
                Uuid::new_v4(),
                base_branch,
                AgentProfile::new(AgentKind::ClaudeCode),
            ))
            .await
            .unwrap()
    }

    async fn container_path(&self, attempt_id: Uuid) -> PathBuf {
        let attempt = self.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
        PathBuf::from(attempt.container_ref.unwrap())
    }

    /// Executable standing in for an agent CLI: ignores its arguments,
    /// swallows the prompt and prints `lines` to stdout
    fn fake_agent(&self, lines: &[&str], side_effect: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = self.data.path().join(format!("agent-{}.sh", Uuid::new_v4().simple()));
        let mut body = String::from("#!/bin/sh\ncat > /dev/null\n");
        for line in lines {
            body.push_str(&format!("printf '%s\\n' '{}'\n", line));
        }
        body.push_str(side_effect);
        body.push('\n');
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }
}

fn script(script: &str, context: ScriptContext) -> ExecutorAction {
    ExecutorAction::new(ExecutorActionType::Script {
        script: script.to_string(),
        language: ScriptLanguage::Bash,
        context,
    })
}

/// Wait for the completion event of `execution_id`, collecting its
/// conversation patches on the way
async fn wait_completed(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    execution_id: Uuid,
) -> (LifecycleEvent, Vec<LogMsg>) {
    let mut patches = Vec::new();
    let event = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Log { execution_id: id, msg }) if id == execution_id => {
                    if matches!(msg, LogMsg::JsonPatch(_)) {
                        patches.push(msg);
                    }
                }
                Ok(event @ LifecycleEvent::ExecutionCompleted { .. })
                    if event.execution_id() == execution_id =>
                {
                    return event;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("execution did not complete in time");
    (event, patches)
}

async fn wait_not_running(manager: &ExecutionManager, execution_id: Uuid) {
    tokio::time::timeout(WAIT, async {
        while manager.is_running(execution_id).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("process still tracked as running");
}

#[tokio::test]
async fn test_script_runs_in_container_and_logs_durably() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let mut events = h.manager.subscribe_events();

    let process = h
        .manager
        .start_for_attempt(
            attempt.id,
            RunReason::SetupScript,
            script("echo installing; echo warn >&2; cat test.txt", ScriptContext::SetupScript),
        )
        .await
        .unwrap();
    assert_eq!(process.status, ExecutionProcessStatus::Running);

    let (event, _) = wait_completed(&mut events, process.id).await;
    assert!(matches!(
        event,
        LifecycleEvent::ExecutionCompleted {
            status: ExecutionProcessStatus::Completed,
            exit_code: Some(0),
            notify_failure: false,
            ..
        }
    ));

    let stored = h.processes.find_by_id(process.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionProcessStatus::Completed);
    assert_eq!(stored.exit_code, Some(0));
    assert!(stored.completed_at.is_some());

    let attempt = h.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert!(attempt.setup_completed_at.is_some());

    let durable = h.logs.load(process.id).await.unwrap();
    assert!(durable.contains(&LogMsg::Stdout("installing\n".to_string())));
    assert!(durable.contains(&LogMsg::Stdout("test content\n".to_string())));
    assert!(durable.contains(&LogMsg::Stderr("warn\n".to_string())));
    assert_eq!(durable.last(), Some(&LogMsg::Finished));

    // Finished executions are served from the durable log
    let raw: Vec<LogMsg> = h
        .manager
        .stream_raw_logs(process.id)
        .await
        .unwrap()
        .map(|s| s.msg)
        .collect()
        .await;
    assert_eq!(raw, durable);
}

#[tokio::test]
async fn test_failing_script_records_exit_code() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let mut events = h.manager.subscribe_events();

    let process = h
        .manager
        .start_for_attempt(attempt.id, RunReason::DevServer, script("exit 3", ScriptContext::DevServer))
        .await
        .unwrap();

    let (event, _) = wait_completed(&mut events, process.id).await;
    assert!(matches!(
        event,
        LifecycleEvent::ExecutionCompleted {
            status: ExecutionProcessStatus::Failed,
            exit_code: Some(3),
            notify_failure: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_stop_is_optimistic_and_late_exit_is_ignored() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let mut events = h.manager.subscribe_events();

    let process = h
        .manager
        .start_for_attempt(attempt.id, RunReason::DevServer, script("sleep 30", ScriptContext::DevServer))
        .await
        .unwrap();

    let stopped = h.manager.stop_execution(process.id).await.unwrap();
    assert_eq!(stopped.status, ExecutionProcessStatus::Killed);
    assert_eq!(stopped.exit_code, Some(KILLED_EXIT_CODE));

    let (event, _) = wait_completed(&mut events, process.id).await;
    assert!(matches!(
        event,
        LifecycleEvent::ExecutionCompleted {
            status: ExecutionProcessStatus::Killed,
            notify_failure: false,
            ..
        }
    ));

    // The natural exit that follows the signal must not overwrite `killed`
    wait_not_running(&h.manager, process.id).await;
    let stored = h.processes.find_by_id(process.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionProcessStatus::Killed);
    assert_eq!(stored.exit_code, Some(KILLED_EXIT_CODE));

    assert!(matches!(
        h.manager.stop_execution(process.id).await,
        Err(ExecutorError::ProcessNotRunning { .. })
    ));
}

#[tokio::test]
async fn test_agent_run_tracks_session_and_commits() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let mut events = h.manager.subscribe_events();

    let agent = h.fake_agent(
        &[
            r#"{"type":"system","subtype":"init","session_id":"sess-42","model":"m1"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"npm test"}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"5 passed","is_error":false}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Added hello.txt"}]}}"#,
        ],
        "echo hi > hello.txt",
    );
    let action = ExecutorAction::new(ExecutorActionType::CodingAgentInitial {
        prompt: "Add a greeting file".to_string(),
        profile: AgentProfile::new(AgentKind::ClaudeCode).with_command_override(agent),
    });

    let process = h
        .manager
        .start_for_attempt(attempt.id, RunReason::CodingAgent, action)
        .await
        .unwrap();
    let (_, live_patches) = wait_completed(&mut events, process.id).await;

    let stored = h.processes.find_by_id(process.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionProcessStatus::Completed);

    let session = h
        .sessions
        .find_by_execution_process(process.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.prompt.as_deref(), Some("Add a greeting file"));
    assert_eq!(session.session_id.as_deref(), Some("sess-42"));
    assert_eq!(session.summary.as_deref(), Some("Added hello.txt"));

    // The summary became the commit message and the container is clean
    let container = h.container_path(attempt.id).await;
    assert_eq!(git(&container, &["log", "-1", "--format=%s"]).trim(), "Added hello.txt");
    assert!(git(&container, &["status", "--porcelain"]).trim().is_empty());

    // Offline replay reproduces the live patch sequence
    let replayed: Vec<LogMsg> = h
        .manager
        .stream_normalized_logs(process.id)
        .await
        .unwrap()
        .map(|s| s.msg)
        .filter(|m| futures::future::ready(!m.is_finished()))
        .collect()
        .await;
    assert_eq!(replayed, live_patches);

    let snapshot = h.manager.conversation_snapshot(process.id).await.unwrap();
    let entries = snapshot.entries().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries[0],
        PatchValue::NormalizedEntry(NormalizedEntry::system("System initialized with model: m1"))
    );
    assert_eq!(
        entries[2],
        PatchValue::NormalizedEntry(NormalizedEntry::assistant("Added hello.txt"))
    );
}

#[tokio::test]
async fn test_next_action_runs_after_success() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let mut events = h.manager.subscribe_events();

    let action = script("echo setup > setup.txt", ScriptContext::SetupScript)
        .then(script("echo cleaned > cleaned.txt", ScriptContext::CleanupScript));
    let first = h
        .manager
        .start_for_attempt(attempt.id, RunReason::SetupScript, action)
        .await
        .unwrap();
    wait_completed(&mut events, first.id).await;

    let second = tokio::time::timeout(WAIT, async {
        loop {
            let processes = h.processes.find_by_task_attempt(attempt.id).await.unwrap();
            if let Some(p) = processes.iter().find(|p| p.id != first.id && !p.is_running()) {
                return p.clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("next action did not run");
    assert_eq!(second.run_reason, RunReason::CleanupScript);
    assert_eq!(second.status, ExecutionProcessStatus::Completed);

    // Setup output stays uncommitted, the cleanup run commits everything
    let container = h.container_path(attempt.id).await;
    wait_not_running(&h.manager, second.id).await;
    assert_eq!(
        git(&container, &["log", "-1", "--format=%s"]).trim(),
        format!("Cleanup script changes for attempt {}", attempt.id)
    );
    assert!(container.join("setup.txt").exists());
    assert!(container.join("cleaned.txt").exists());
}

#[tokio::test]
async fn test_failed_run_does_not_chain() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let mut events = h.manager.subscribe_events();

    let action = script("exit 1", ScriptContext::SetupScript)
        .then(script("echo never", ScriptContext::CleanupScript));
    let first = h
        .manager
        .start_for_attempt(attempt.id, RunReason::SetupScript, action)
        .await
        .unwrap();
    wait_completed(&mut events, first.id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let processes = h.processes.find_by_task_attempt(attempt.id).await.unwrap();
    assert_eq!(processes.len(), 1);
    let attempt = h.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert!(attempt.setup_completed_at.is_none());
}

#[tokio::test]
async fn test_missing_base_branch_fails_execution() {
    let h = harness().await;
    let attempt = h.attempt("does-not-exist").await;

    let err = h
        .manager
        .start_for_attempt(attempt.id, RunReason::SetupScript, script("true", ScriptContext::SetupScript))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::BaseBranchMissing { .. }));

    let processes = h.processes.find_by_task_attempt(attempt.id).await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].status, ExecutionProcessStatus::Failed);
    assert_eq!(processes[0].exit_code, Some(-1));

    let raw: Vec<LogMsg> = h
        .manager
        .stream_raw_logs(processes[0].id)
        .await
        .unwrap()
        .map(|s| s.msg)
        .collect()
        .await;
    assert!(matches!(&raw[0], LogMsg::Stderr(line) if line.contains("does-not-exist")));
    assert_eq!(raw.last(), Some(&LogMsg::Finished));
}

#[tokio::test]
async fn test_expiry_skips_attempts_with_running_processes() {
    let h = harness_with(ExecutionManagerConfig {
        kill_grace: Duration::from_millis(500),
        worktree_ttl: chrono::Duration::zero(),
        ..Default::default()
    })
    .await;
    let attempt = h.attempt("main").await;

    let dev_server = h
        .manager
        .start_for_attempt(attempt.id, RunReason::DevServer, script("sleep 30", ScriptContext::DevServer))
        .await
        .unwrap();
    let container = h.container_path(attempt.id).await;

    assert_eq!(h.manager.cleanup_expired().await.unwrap(), 0);
    assert!(container.exists());

    h.manager.stop_execution(dev_server.id).await.unwrap();
    wait_not_running(&h.manager, dev_server.id).await;

    assert_eq!(h.manager.cleanup_expired().await.unwrap(), 1);
    assert!(!container.exists());
    let attempt = h.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert!(attempt.worktree_deleted);

    // Nothing left to reclaim
    assert_eq!(h.manager.cleanup_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_container_stops_running_processes() {
    let h = harness().await;
    let attempt = h.attempt("main").await;

    let process = h
        .manager
        .start_for_attempt(attempt.id, RunReason::DevServer, script("sleep 30", ScriptContext::DevServer))
        .await
        .unwrap();
    let container = h.container_path(attempt.id).await;

    h.manager.delete_container(attempt.id).await.unwrap();
    assert!(!container.exists());

    let stored = h.processes.find_by_id(process.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionProcessStatus::Killed);
}

#[tokio::test]
async fn test_recover_interrupted_marks_orphans_failed() {
    let h = harness().await;
    let attempt = h.attempt("main").await;
    let orphan = h
        .processes
        .create(conductor_core::execution::ExecutionProcess::new(
            attempt.id,
            RunReason::DevServer,
            script("npm run dev", ScriptContext::DevServer),
        ))
        .await
        .unwrap();

    assert_eq!(h.manager.recover_interrupted().await.unwrap(), 1);
    let stored = h.processes.find_by_id(orphan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionProcessStatus::Failed);
    assert_eq!(h.logs.load(orphan.id).await.unwrap(), vec![LogMsg::Finished]);
    assert_eq!(h.manager.recover_interrupted().await.unwrap(), 0);
}

/// Container backend whose `ensure_exists` stalls for one attempt
struct SlowContainer {
    inner: Arc<dyn ContainerService>,
    slow_attempt: Arc<OnceLock<Uuid>>,
    delay: Duration,
}

#[async_trait]
impl ContainerService for SlowContainer {
    async fn create(&self, attempt: &TaskAttempt) -> agent_runner::Result<PathBuf> {
        self.inner.create(attempt).await
    }

    async fn ensure_exists(&self, attempt: &TaskAttempt) -> agent_runner::Result<PathBuf> {
        if self.slow_attempt.get() == Some(&attempt.id) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.ensure_exists(attempt).await
    }

    async fn is_clean(&self, attempt: &TaskAttempt) -> agent_runner::Result<bool> {
        self.inner.is_clean(attempt).await
    }

    async fn remove(&self, attempt: &TaskAttempt) -> agent_runner::Result<()> {
        self.inner.remove(attempt).await
    }

    async fn get_diff(&self, attempt: &TaskAttempt) -> agent_runner::Result<DiffStream> {
        self.inner.get_diff(attempt).await
    }

    async fn commit_changes(&self, attempt: &TaskAttempt, message: &str) -> agent_runner::Result<bool> {
        self.inner.commit_changes(attempt, message).await
    }

    async fn cleanup_orphans(&self) -> agent_runner::Result<usize> {
        self.inner.cleanup_orphans().await
    }
}

#[tokio::test]
async fn test_slow_container_does_not_block_other_attempts() {
    let slow_attempt = Arc::new(OnceLock::new());
    let marker = Arc::clone(&slow_attempt);
    let h = harness_wrapping(
        ExecutionManagerConfig {
            kill_grace: Duration::from_millis(500),
            ..Default::default()
        },
        move |inner| {
            Arc::new(SlowContainer {
                inner,
                slow_attempt: marker,
                delay: Duration::from_secs(3),
            })
        },
    )
    .await;
    let slow_id = h.attempt("main").await.id;
    slow_attempt.set(slow_id).unwrap();
    let fast = h.attempt("main").await;

    let running = h
        .manager
        .start_for_attempt(fast.id, RunReason::DevServer, script("sleep 30", ScriptContext::DevServer))
        .await
        .unwrap();

    let manager = h.manager.clone();
    let slow_start = tokio::spawn(async move {
        manager
            .start_for_attempt(slow_id, RunReason::DevServer, script("sleep 30", ScriptContext::DevServer))
            .await
    });
    // Let the slow start reach its container
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    let stopped = h.manager.stop_execution(running.id).await.unwrap();
    assert_eq!(stopped.status, ExecutionProcessStatus::Killed);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "stop waited {:?} on another attempt's container",
        started.elapsed()
    );
    assert!(!slow_start.is_finished());

    let slow_process = slow_start.await.unwrap().unwrap();
    h.manager.stop_execution(slow_process.id).await.unwrap();
}

#[tokio::test]
async fn test_live_stream_backfills_evicted_history() {
    let h = harness_with(ExecutionManagerConfig {
        kill_grace: Duration::from_millis(500),
        msg_limits: MsgStoreLimits {
            max_bytes: usize::MAX,
            max_entries: 4,
        },
        ..Default::default()
    })
    .await;
    let attempt = h.attempt("main").await;

    let process = h
        .manager
        .start_for_attempt(
            attempt.id,
            RunReason::DevServer,
            script("for i in $(seq 1 50); do echo line$i; done; sleep 3", ScriptContext::DevServer),
        )
        .await
        .unwrap();

    // All output is in the durable log while the process is still running
    tokio::time::timeout(WAIT, async {
        while h.logs.load(process.id).await.unwrap().len() < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("output not logged in time");
    assert!(h.manager.is_running(process.id).await);

    let msgs: Vec<_> = tokio::time::timeout(WAIT, h.manager.stream_raw_logs(process.id).await.unwrap().collect())
        .await
        .expect("stream did not end");

    let seqs: Vec<u64> = msgs.iter().map(|m| m.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{:?}", seqs);
    let stdout: String = msgs
        .iter()
        .filter_map(|m| match &m.msg {
            LogMsg::Stdout(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    let expected: String = (1..=50).map(|i| format!("line{}\n", i)).collect();
    assert_eq!(stdout, expected);
    assert_eq!(msgs.last().map(|m| &m.msg), Some(&LogMsg::Finished));
}
