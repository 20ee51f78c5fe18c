//! Execution manager - orchestrates execution processes within task attempts
//!
//! For every execution the manager resolves the attempt's container, spawns
//! the process, feeds its output into a [`MsgStore`], runs the log
//! normalizer for coding agents and records the terminal state. The store is
//! mirrored to the durable log as messages are pushed, so finished
//! executions can be replayed after they leave memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use conductor_core::attempt::{TaskAttempt, TaskAttemptRepository};
use conductor_core::execution::{
    ExecutionProcess, ExecutionProcessRepository, ExecutionProcessStatus, ExecutorAction,
    ExecutorActionType, RunReason, ScriptContext, KILLED_EXIT_CODE,
};
use conductor_core::logs::{
    ConversationPatch, ConversationSnapshot, ExecutionLogRepository, LogMsg, NormalizedEntryType,
};
use conductor_core::session::{ExecutorSession, ExecutorSessionRepository};
use conductor_core::BestEffort;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::build_process_spec;
use crate::container::ContainerService;
use crate::error::{ExecutorError, Result};
use crate::event::LifecycleEvent;
use crate::expiry::{select_expired_attempts, DEFAULT_WORKTREE_TTL_HOURS};
use crate::logs::{spawn_normalizer, ClusterThresholds, NormalizerHandle};
use crate::msg_store::{MsgStore, MsgStoreLimits, SequencedMsg, Subscription};
use crate::process::{ExitOutcome, ProcessEvent, ProcessHandle, ProcessRunner, DEFAULT_KILL_GRACE};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Exit code recorded when an execution never got to run
const STARTUP_FAILURE_EXIT_CODE: i64 = -1;

/// Configuration for the execution manager
#[derive(Debug, Clone)]
pub struct ExecutionManagerConfig {
    /// Time between the termination signal and the forced kill
    pub kill_grace: Duration,
    /// Idle time after which an attempt's container is reclaimed
    pub worktree_ttl: chrono::Duration,
    pub cluster_thresholds: ClusterThresholds,
    pub msg_limits: MsgStoreLimits,
}

impl Default for ExecutionManagerConfig {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            worktree_ttl: chrono::Duration::hours(DEFAULT_WORKTREE_TTL_HOURS),
            cluster_thresholds: ClusterThresholds::default(),
            msg_limits: MsgStoreLimits::default(),
        }
    }
}

/// Storage collaborators the manager depends on
#[derive(Clone)]
pub struct Repositories {
    pub processes: Arc<dyn ExecutionProcessRepository>,
    pub attempts: Arc<dyn TaskAttemptRepository>,
    pub sessions: Arc<dyn ExecutorSessionRepository>,
    pub logs: Arc<dyn ExecutionLogRepository>,
}

struct RunningExecution {
    handle: ProcessHandle,
    msg_store: Arc<MsgStore>,
    /// Number of leading messages already in the durable log
    persisted: watch::Receiver<u64>,
    task_attempt_id: Uuid,
}

struct Inner {
    config: ExecutionManagerConfig,
    repos: Repositories,
    container: Arc<dyn ContainerService>,
    runner: ProcessRunner,
    running: RwLock<HashMap<Uuid, RunningExecution>>,
    /// Per-attempt locks serializing process state transitions against the
    /// expiry scan. Container I/O happens only under the attempt's own lock.
    attempt_locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

/// Everything the monitor task owns for one execution
struct Monitored {
    process: ExecutionProcess,
    cwd: PathBuf,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    msg_store: Arc<MsgStore>,
    normalizer: Option<NormalizerHandle>,
    mirror: DurableMirror,
}

/// Copies every pushed message to the durable log, in push order
struct DurableMirror {
    subscription: Subscription,
    persisted: watch::Receiver<u64>,
    join: JoinHandle<()>,
}

impl DurableMirror {
    /// Wait until `Finished` has been written
    async fn finish(self) {
        if let Err(e) = self.join.await {
            warn!("Durable log writer failed: {}", e);
        }
        self.subscription.unsubscribe();
    }
}

/// Cloneable handle to the execution manager
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

impl ExecutionManager {
    pub fn new(
        config: ExecutionManagerConfig,
        repos: Repositories,
        container: Arc<dyn ContainerService>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                runner: ProcessRunner::new(config.kill_grace),
                config,
                repos,
                container,
                running: RwLock::new(HashMap::new()),
                attempt_locks: std::sync::Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.inner.repos
    }

    pub fn container(&self) -> &Arc<dyn ContainerService> {
        &self.inner.container
    }

    /// Lifecycle events of all executions from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_running(&self, execution_id: Uuid) -> bool {
        self.inner.running.read().await.contains_key(&execution_id)
    }

    pub async fn get_process(&self, execution_id: Uuid) -> Result<ExecutionProcess> {
        self.inner
            .repos
            .processes
            .find_by_id(execution_id)
            .await?
            .ok_or(ExecutorError::ProcessNotFound {
                process_id: execution_id,
            })
    }

    async fn lock_attempt(&self, attempt_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .attempt_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // Nobody holds or waits on a lock whose only reference is the map's
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(attempt_id).or_default())
        };
        lock.lock_owned().await
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<TaskAttempt> {
        self.inner
            .repos
            .attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or(ExecutorError::AttemptNotFound { attempt_id })
    }

    /// Start `action` in the attempt's container, creating the container
    /// first if the attempt does not have one yet.
    ///
    /// When the container cannot be materialized the execution is still
    /// recorded, as failed, and the error is returned.
    pub async fn start_for_attempt(
        &self,
        attempt_id: Uuid,
        run_reason: RunReason,
        action: ExecutorAction,
    ) -> Result<ExecutionProcess> {
        let attempt = self.get_attempt(attempt_id).await?;
        let (process, cwd) = {
            let _guard = self.lock_attempt(attempt.id).await;
            let process = self
                .inner
                .repos
                .processes
                .create(ExecutionProcess::new(attempt.id, run_reason, action))
                .await?;
            match self.inner.container.ensure_exists(&attempt).await {
                Ok(cwd) => (process, cwd),
                Err(e) => {
                    drop(_guard);
                    error!("Cannot prepare container for attempt {}: {}", attempt.id, e);
                    self.record_startup_failure(&process, &e).await;
                    return Err(e);
                }
            }
        };
        self.launch(process, cwd).await
    }

    /// Record `process` and run it in `cwd`
    pub async fn start_execution(
        &self,
        process: ExecutionProcess,
        cwd: impl AsRef<Path>,
    ) -> Result<ExecutionProcess> {
        let process = {
            let _guard = self.lock_attempt(process.task_attempt_id).await;
            self.inner.repos.processes.create(process).await?
        };
        self.launch(process, cwd.as_ref().to_path_buf()).await
    }

    /// Boxed start used when chaining, so the monitor future does not
    /// contain itself
    fn start_next(&self, process: ExecutionProcess, cwd: PathBuf) -> BoxFuture<'static, Result<ExecutionProcess>> {
        let manager = self.clone();
        async move { manager.start_execution(process, cwd).await }.boxed()
    }

    async fn launch(&self, process: ExecutionProcess, cwd: PathBuf) -> Result<ExecutionProcess> {
        let inner = &self.inner;

        if let Some(profile) = process.executor_action.profile() {
            let session = ExecutorSession::new(
                process.task_attempt_id,
                process.id,
                process.executor_action.prompt().map(str::to_string),
            );
            inner.repos.sessions.create(session).await?;
            debug!("Created {} session for execution {}", profile.agent.as_str(), process.id);
        }

        let msg_store = Arc::new(MsgStore::with_limits(inner.config.msg_limits));
        let mirror = self.mirror_to_durable_log(process.id, &msg_store);

        let spawned = match build_process_spec(&process.executor_action, &cwd) {
            Ok(spec) => inner.runner.spawn(spec).await,
            Err(e) => Err(e),
        };
        let (handle, events) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to start execution {}: {}", process.id, e);
                msg_store.push_stderr(format!("{}\n", e));
                msg_store.push_finished();
                mirror.finish().await;
                self.fail_startup(&process).await;
                return Err(e);
            }
        };

        info!(
            "Started execution {} ({}) for attempt {} with pid {:?}",
            process.id,
            process.run_reason,
            process.task_attempt_id,
            handle.pid()
        );

        inner.running.write().await.insert(
            process.id,
            RunningExecution {
                handle: handle.clone(),
                msg_store: Arc::clone(&msg_store),
                persisted: mirror.persisted.clone(),
                task_attempt_id: process.task_attempt_id,
            },
        );

        // A stop that raced with the spawn already recorded the terminal state
        if matches!(self.get_process(process.id).await, Ok(p) if p.status.is_terminal()) {
            handle.kill();
        }

        let normalizer = process.executor_action.profile().map(|profile| {
            spawn_normalizer(
                Arc::clone(&msg_store),
                profile.agent.log_format(),
                profile.agent.history_strategy(),
                &cwd,
                inner.config.cluster_thresholds,
            )
        });

        self.emit(LifecycleEvent::started(
            process.id,
            process.task_attempt_id,
            process.run_reason,
        ));

        let manager = self.clone();
        tokio::spawn(manager.monitor(Monitored {
            process: process.clone(),
            cwd,
            events,
            msg_store,
            normalizer,
            mirror,
        }));

        Ok(process)
    }

    fn mirror_to_durable_log(&self, execution_id: Uuid, msg_store: &Arc<MsgStore>) -> DurableMirror {
        let (tx, mut rx) = mpsc::unbounded_channel::<SequencedMsg>();
        let (persisted_tx, persisted) = watch::channel(0u64);
        let events = self.inner.events.clone();
        let subscription = msg_store.subscribe(move |sequenced: &SequencedMsg| {
            let _ = tx.send(sequenced.clone());
            let _ = events.send(LifecycleEvent::Log {
                execution_id,
                msg: sequenced.msg.clone(),
            });
        });

        let logs = Arc::clone(&self.inner.repos.logs);
        let sessions = Arc::clone(&self.inner.repos.sessions);
        let join = tokio::spawn(async move {
            while let Some(SequencedMsg { seq, msg }) = rx.recv().await {
                if let Err(e) = logs.append(execution_id, &msg).await {
                    warn!("Failed to append to log of execution {}: {}", execution_id, e);
                }
                persisted_tx.send_replace(seq + 1);
                match &msg {
                    LogMsg::SessionId(session_id) => {
                        info!("Execution {} has agent session {}", execution_id, session_id);
                        sessions
                            .update_session_id(execution_id, session_id)
                            .await
                            .best_effort("Recording agent session id");
                    }
                    LogMsg::Finished => break,
                    _ => {}
                }
            }
        });

        DurableMirror {
            subscription,
            persisted,
            join,
        }
    }

    async fn monitor(self, run: Monitored) {
        let Monitored {
            process,
            cwd,
            mut events,
            msg_store,
            normalizer,
            mirror,
        } = run;

        let mut outcome = ExitOutcome {
            code: None,
            signal: None,
        };
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => msg_store.push_stdout(chunk),
                ProcessEvent::Stderr(chunk) => msg_store.push_stderr(chunk),
                ProcessEvent::Error(message) => {
                    warn!("Execution {}: {}", process.id, message);
                    msg_store.push_stderr(format!("{}\n", message));
                }
                ProcessEvent::Exit(exit) => {
                    outcome = exit;
                    break;
                }
            }
        }

        if let Some(normalizer) = normalizer {
            normalizer.finish(&msg_store).await;
        }
        let summary = last_assistant_message(&msg_store);

        let recorded = self.handle_exit(&process, outcome, summary).await;

        msg_store.push_finished();
        mirror.finish().await;
        self.inner.running.write().await.remove(&process.id);

        let Some(status) = recorded else { return };
        self.emit(LifecycleEvent::completed(
            process.id,
            process.task_attempt_id,
            process.run_reason,
            status,
            Some(outcome.recorded_code()),
        ));

        if status != ExecutionProcessStatus::Completed {
            return;
        }
        if let Some(next) = process.executor_action.next_action.clone() {
            let next = *next;
            let next_process = ExecutionProcess::new(process.task_attempt_id, run_reason_for(&next), next);
            info!(
                "Execution {} finished, starting next action {} ({})",
                process.id, next_process.id, next_process.run_reason
            );
            if let Err(e) = self.start_next(next_process, cwd).await {
                error!("Failed to start next action after execution {}: {}", process.id, e);
            }
        }
    }

    /// Record a natural exit. Returns the recorded status, or `None` when a
    /// terminal state was already written (the exit is stale).
    async fn handle_exit(
        &self,
        process: &ExecutionProcess,
        outcome: ExitOutcome,
        summary: Option<String>,
    ) -> Option<ExecutionProcessStatus> {
        let repos = &self.inner.repos;
        let status = if outcome.success() {
            ExecutionProcessStatus::Completed
        } else {
            ExecutionProcessStatus::Failed
        };
        let exit_code = outcome.recorded_code();

        let updated = {
            let _guard = self.lock_attempt(process.task_attempt_id).await;
            repos
                .processes
                .update_completion(process.id, status, Some(exit_code))
                .await
        };
        match updated {
            Ok(true) => info!(
                "Execution {} {} with exit code {}",
                process.id,
                status.as_str(),
                exit_code
            ),
            Ok(false) => {
                debug!("Ignoring stale exit of execution {}, already terminal", process.id);
                return None;
            }
            Err(e) => {
                error!("Failed to record completion of execution {}: {}", process.id, e);
                return None;
            }
        }

        if process.executor_action.profile().is_some() {
            if let Some(summary) = &summary {
                repos
                    .sessions
                    .update_summary(process.id, summary)
                    .await
                    .best_effort("Recording session summary");
            }
        }

        if process.run_reason == RunReason::SetupScript && status == ExecutionProcessStatus::Completed {
            repos
                .attempts
                .mark_setup_completed(process.task_attempt_id)
                .await
                .best_effort("Marking setup completed");
        }

        if process.run_reason.commits_on_completion() {
            self.commit_on_completion(process, summary.as_deref())
                .await
                .best_effort("Auto-commit");
        }

        Some(status)
    }

    async fn commit_on_completion(&self, process: &ExecutionProcess, summary: Option<&str>) -> Result<bool> {
        let attempt = self.get_attempt(process.task_attempt_id).await?;
        let message = match (process.run_reason, summary) {
            (RunReason::CodingAgent, Some(summary)) if !summary.trim().is_empty() => summary.to_string(),
            (RunReason::CleanupScript, _) => format!("Cleanup script changes for attempt {}", attempt.id),
            _ => format!("Commit changes from coding agent for attempt {}", attempt.id),
        };
        self.inner.container.commit_changes(&attempt, &message).await
    }

    async fn fail_startup(&self, process: &ExecutionProcess) {
        let updated = {
            let _guard = self.lock_attempt(process.task_attempt_id).await;
            self.inner
                .repos
                .processes
                .update_completion(
                    process.id,
                    ExecutionProcessStatus::Failed,
                    Some(STARTUP_FAILURE_EXIT_CODE),
                )
                .await
        };
        if updated.best_effort("Recording startup failure") == Some(true) {
            self.emit(LifecycleEvent::completed(
                process.id,
                process.task_attempt_id,
                process.run_reason,
                ExecutionProcessStatus::Failed,
                Some(STARTUP_FAILURE_EXIT_CODE),
            ));
        }
    }

    /// Failure before any process existed: write the reason to the durable
    /// log so the execution's streams explain it
    async fn record_startup_failure(&self, process: &ExecutionProcess, err: &ExecutorError) {
        let logs = &self.inner.repos.logs;
        for msg in [LogMsg::Stderr(format!("{}\n", err)), LogMsg::Finished] {
            logs.append(process.id, &msg)
                .await
                .best_effort("Writing startup failure to log");
        }
        self.fail_startup(process).await;
    }

    /// Stop a running execution.
    ///
    /// The `killed` status is written before the process is signalled and
    /// without waiting for it to exit; its later exit is ignored.
    pub async fn stop_execution(&self, execution_id: Uuid) -> Result<ExecutionProcess> {
        let process = self.get_process(execution_id).await?;
        if !process.is_running() {
            return Err(ExecutorError::ProcessNotRunning {
                process_id: execution_id,
            });
        }

        let updated = {
            let _guard = self.lock_attempt(process.task_attempt_id).await;
            self.inner
                .repos
                .processes
                .update_completion(
                    execution_id,
                    ExecutionProcessStatus::Killed,
                    Some(KILLED_EXIT_CODE),
                )
                .await?
        };
        if !updated {
            return Err(ExecutorError::ProcessNotRunning {
                process_id: execution_id,
            });
        }

        match self.inner.running.read().await.get(&execution_id) {
            Some(running) => running.handle.kill(),
            None => warn!("Execution {} has no live process to signal", execution_id),
        }
        info!("Stopped execution {}", execution_id);

        self.emit(LifecycleEvent::completed(
            execution_id,
            process.task_attempt_id,
            process.run_reason,
            ExecutionProcessStatus::Killed,
            Some(KILLED_EXIT_CODE),
        ));
        self.get_process(execution_id).await
    }

    /// Stop the attempt's running executions, then remove its container
    pub async fn delete_container(&self, attempt_id: Uuid) -> Result<()> {
        let attempt = self.get_attempt(attempt_id).await?;

        let running: Vec<Uuid> = self
            .inner
            .running
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.task_attempt_id == attempt_id)
            .map(|(id, _)| *id)
            .collect();
        for execution_id in running {
            match self.stop_execution(execution_id).await {
                Ok(_) | Err(ExecutorError::ProcessNotRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let _guard = self.lock_attempt(attempt_id).await;
        self.inner.container.remove(&attempt).await
    }

    /// Raw stdout and stderr, history first, ending with `Finished`
    pub async fn stream_raw_logs(&self, execution_id: Uuid) -> Result<BoxStream<'static, SequencedMsg>> {
        let stream = match self.live_stream(execution_id).await? {
            Some(stream) => stream,
            None => self.replay_raw(execution_id).await?.history_plus_stream(),
        };
        Ok(keep_only(stream, |msg| {
            matches!(msg, LogMsg::Stdout(_) | LogMsg::Stderr(_))
        }))
    }

    /// Conversation patches, history first, ending with `Finished`
    pub async fn stream_normalized_logs(
        &self,
        execution_id: Uuid,
    ) -> Result<BoxStream<'static, SequencedMsg>> {
        let stream = match self.live_stream(execution_id).await? {
            Some(stream) => stream,
            None => self.replay_normalized(execution_id).await?.history_plus_stream(),
        };
        Ok(keep_only(stream, |msg| matches!(msg, LogMsg::JsonPatch(_))))
    }

    /// The conversation as rendered from the patches emitted so far
    pub async fn conversation_snapshot(&self, execution_id: Uuid) -> Result<ConversationSnapshot> {
        let msgs: Vec<LogMsg> = match self.live_parts(execution_id).await {
            Some((store, mut persisted)) => {
                let history = store.sequenced_history();
                let first_seq = history.first().map_or(store.next_seq(), |m| m.seq);
                let mut msgs = self
                    .evicted_prefix(execution_id, first_seq, &mut persisted)
                    .await?;
                msgs.extend(history);
                msgs.into_iter().map(|m| m.msg).collect()
            }
            None => self.replay_normalized(execution_id).await?.history(),
        };
        let mut snapshot = ConversationSnapshot::new();
        for msg in msgs {
            if let LogMsg::JsonPatch(patch) = msg {
                snapshot
                    .apply(&patch)
                    .best_effort("Applying conversation patch");
            }
        }
        Ok(snapshot)
    }

    async fn live_parts(&self, execution_id: Uuid) -> Option<(Arc<MsgStore>, watch::Receiver<u64>)> {
        self.inner
            .running
            .read()
            .await
            .get(&execution_id)
            .map(|r| (Arc::clone(&r.msg_store), r.persisted.clone()))
    }

    /// Everything a running execution has pushed, live from then on. The
    /// part evicted from memory is read back from the durable log.
    async fn live_stream(&self, execution_id: Uuid) -> Result<Option<BoxStream<'static, SequencedMsg>>> {
        let Some((store, mut persisted)) = self.live_parts(execution_id).await else {
            return Ok(None);
        };
        let (first_seq, live) = store.history_plus_stream_at();
        if first_seq == 0 {
            return Ok(Some(live));
        }
        let prefix = self
            .evicted_prefix(execution_id, first_seq, &mut persisted)
            .await?;
        Ok(Some(stream::iter(prefix).chain(live).boxed()))
    }

    /// Messages `0..first_seq` from the durable log. The log holds the
    /// store's messages in push order, so log position is the sequence number.
    async fn evicted_prefix(
        &self,
        execution_id: Uuid,
        first_seq: u64,
        persisted: &mut watch::Receiver<u64>,
    ) -> Result<Vec<SequencedMsg>> {
        if first_seq == 0 {
            return Ok(Vec::new());
        }
        if persisted.wait_for(|n| *n >= first_seq).await.is_err() {
            debug!("Durable log writer of execution {} already stopped", execution_id);
        }
        let msgs = self.inner.repos.logs.load(execution_id).await?;
        Ok((0u64..)
            .zip(msgs)
            .take_while(|(seq, _)| *seq < first_seq)
            .map(|(seq, msg)| SequencedMsg { seq, msg })
            .collect())
    }

    async fn replay_raw(&self, execution_id: Uuid) -> Result<Arc<MsgStore>> {
        self.get_process(execution_id).await?;
        let store = Arc::new(MsgStore::with_limits(replay_limits()));
        for msg in self.inner.repos.logs.load(execution_id).await? {
            store.push(msg);
        }
        store.push_finished();
        Ok(store)
    }

    /// Rebuild the conversation of a finished execution by running the
    /// agent's processor over its durable raw output again
    async fn replay_normalized(&self, execution_id: Uuid) -> Result<Arc<MsgStore>> {
        let process = self.get_process(execution_id).await?;
        let msgs = self.inner.repos.logs.load(execution_id).await?;
        let store = Arc::new(MsgStore::with_limits(replay_limits()));

        let Some(profile) = process.executor_action.profile() else {
            for msg in msgs {
                store.push(msg);
            }
            store.push_finished();
            return Ok(store);
        };

        for msg in msgs {
            if matches!(msg, LogMsg::Stdout(_) | LogMsg::Stderr(_)) {
                store.push(msg);
            }
        }
        let cwd = self.container_dir(process.task_attempt_id).await;
        let normalizer = spawn_normalizer(
            Arc::clone(&store),
            profile.agent.log_format(),
            profile.agent.history_strategy(),
            &cwd,
            self.inner.config.cluster_thresholds,
        );
        normalizer.finish(&store).await;
        store.push_finished();
        Ok(store)
    }

    async fn container_dir(&self, attempt_id: Uuid) -> PathBuf {
        match self.inner.repos.attempts.find_by_id(attempt_id).await {
            Ok(Some(TaskAttempt {
                container_ref: Some(path),
                ..
            })) => PathBuf::from(path),
            _ => PathBuf::from("."),
        }
    }

    /// Mark executions left `running` by a previous run of the server as
    /// failed. Returns how many were recovered.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stale = self.inner.repos.processes.find_running().await?;

        let mut recovered = 0;
        for process in stale {
            let _guard = self.lock_attempt(process.task_attempt_id).await;
            if self.is_running(process.id).await {
                continue;
            }
            let updated = self
                .inner
                .repos
                .processes
                .update_completion(
                    process.id,
                    ExecutionProcessStatus::Failed,
                    Some(STARTUP_FAILURE_EXIT_CODE),
                )
                .await?;
            if updated {
                self.inner
                    .repos
                    .logs
                    .append(process.id, &LogMsg::Finished)
                    .await
                    .best_effort("Closing interrupted log");
                warn!("Execution {} was interrupted, marked failed", process.id);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Remove containers of attempts idle for longer than the configured
    /// TTL, then sweep orphan directories. Returns how many containers were
    /// removed.
    ///
    /// Each candidate is checked again under its attempt's lock, so no
    /// execution of it can start or finish between that check and removal.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let repos = &self.inner.repos;
        let attempts = repos.attempts.list().await?;
        let candidates = self.expired_among(&attempts).await?;

        let mut removed = 0;
        for attempt_id in candidates {
            let _guard = self.lock_attempt(attempt_id).await;
            let Some(attempt) = repos.attempts.find_by_id(attempt_id).await? else {
                continue;
            };
            if self.expired_among(std::slice::from_ref(&attempt)).await?.is_empty() {
                debug!("Attempt {} became active, keeping its container", attempt_id);
                continue;
            }
            info!("Container of attempt {} expired, removing", attempt_id);
            if self
                .inner
                .container
                .remove(&attempt)
                .await
                .best_effort("Removing expired container")
                .is_some()
            {
                removed += 1;
            }
        }

        if let Some(orphans) = self
            .inner
            .container
            .cleanup_orphans()
            .await
            .best_effort("Sweeping orphan containers")
        {
            if orphans > 0 {
                info!("Removed {} orphan container directories", orphans);
            }
        }
        Ok(removed)
    }

    async fn expired_among(&self, attempts: &[TaskAttempt]) -> Result<Vec<Uuid>> {
        let mut processes = Vec::new();
        for attempt in attempts
            .iter()
            .filter(|a| !a.worktree_deleted && a.container_ref.is_some())
        {
            processes.extend(self.inner.repos.processes.find_by_task_attempt(attempt.id).await?);
        }
        Ok(select_expired_attempts(
            attempts,
            &processes,
            Utc::now(),
            self.inner.config.worktree_ttl,
        ))
    }

    fn emit(&self, event: LifecycleEvent) {
        debug!("Lifecycle event {} for {}", event.name(), event.execution_id());
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Run reason implied by an action when it is started by chaining
pub fn run_reason_for(action: &ExecutorAction) -> RunReason {
    match &action.typ {
        ExecutorActionType::CodingAgentInitial { .. } | ExecutorActionType::CodingAgentFollowUp { .. } => {
            RunReason::CodingAgent
        }
        ExecutorActionType::Script { context, .. } => match context {
            ScriptContext::SetupScript => RunReason::SetupScript,
            ScriptContext::CleanupScript => RunReason::CleanupScript,
            ScriptContext::DevServer => RunReason::DevServer,
        },
    }
}

/// Content of the last assistant message in the store's patches
fn last_assistant_message(msg_store: &MsgStore) -> Option<String> {
    msg_store
        .history()
        .iter()
        .filter_map(|msg| match msg {
            LogMsg::JsonPatch(patch) => assistant_content(patch),
            _ => None,
        })
        .last()
}

fn assistant_content(patch: &ConversationPatch) -> Option<String> {
    match patch.normalized_entry() {
        Some((_, entry)) if entry.entry_type == NormalizedEntryType::AssistantMessage => {
            Some(entry.content.clone())
        }
        _ => None,
    }
}

/// Replayed stores hold the complete log
fn replay_limits() -> MsgStoreLimits {
    MsgStoreLimits {
        max_bytes: usize::MAX,
        max_entries: usize::MAX,
    }
}

fn keep_only(
    stream: BoxStream<'static, SequencedMsg>,
    keep: fn(&LogMsg) -> bool,
) -> BoxStream<'static, SequencedMsg> {
    stream
        .filter(move |item| future::ready(keep(&item.msg) || item.msg.is_finished()))
        .boxed()
}
