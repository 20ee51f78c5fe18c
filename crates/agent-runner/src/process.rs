//! Process runner
//!
//! Spawns one OS process per execution, forwards its output as events and
//! exposes non-blocking status and kill operations.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};
use crate::shell::get_shell_command;

/// Grace period between the termination signal and the forced kill
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on waiting for output pipes to drain after exit. Detached
/// grandchildren can hold the pipes open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to run and where
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Written to stdin once output listeners are attached, then stdin is closed
    pub stdin: Option<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            stdin: None,
        }
    }

    /// Run a command line through the platform shell
    pub fn shell(command: &str, working_dir: impl Into<PathBuf>) -> Self {
        let (shell, flag) = get_shell_command();
        Self::new(shell, working_dir).arg(flag).arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code to record, using the shell convention 128 + signal for
    /// signal deaths and -1 when neither is known
    pub fn recorded_code(&self) -> i64 {
        match (self.code, self.signal) {
            (Some(code), _) => i64::from(code),
            (None, Some(signal)) => 128 + i64::from(signal),
            (None, None) => -1,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Events emitted by a running process, in order. `Exit` is always last and
/// arrives after all output has been forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of stdout, one line including its newline when present
    Stdout(String),
    Stderr(String),
    Exit(ExitOutcome),
    Error(String),
}

/// Spawns processes with a shared kill policy
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Spawn a process and start forwarding its output.
    ///
    /// Output readers are attached before the stdin payload is written so a
    /// fast-exiting process cannot lose its first bytes.
    pub async fn spawn(
        &self,
        spec: ProcessSpec,
    ) -> Result<(ProcessHandle, mpsc::UnboundedReceiver<ProcessEvent>)> {
        info!(
            "Spawning {} {:?} in {}",
            spec.program,
            spec.args,
            spec.working_dir.display()
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reaches the whole tree
        #[cfg(unix)]
        cmd.process_group(0);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::spawn_failed_with_source(
                format!("Failed to spawn {}: {}", spec.program, e),
                e,
            )
        })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stderr"))?;
        let stdin = child.stdin.take();

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let stdout_handle = tokio::spawn(forward_lines(stdout, event_tx.clone(), ProcessEvent::Stdout));
        let stderr_handle = tokio::spawn(forward_lines(stderr, event_tx.clone(), ProcessEvent::Stderr));

        // Dropping stdin closes it, with or without a payload
        if let Some(mut stdin) = stdin {
            let payload = spec.stdin.clone();
            let stdin_tx = event_tx.clone();
            tokio::spawn(async move {
                if let Some(payload) = payload {
                    if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                        let _ = stdin_tx.send(ProcessEvent::Error(format!(
                            "Failed to write stdin: {}",
                            e
                        )));
                    }
                    let _ = stdin.shutdown().await;
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (force_tx, mut force_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = force_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to force kill process {:?}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let drained = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, async {
                let _ = stdout_handle.await;
                let _ = stderr_handle.await;
            })
            .await;
            if drained.is_err() {
                warn!("Output of process {:?} still open after exit, not waiting further", pid);
            }

            let outcome = match status {
                Ok(status) => ExitOutcome::from(status),
                Err(e) => {
                    let _ = event_tx.send(ProcessEvent::Error(format!("Failed to wait for process: {}", e)));
                    ExitOutcome {
                        code: None,
                        signal: None,
                    }
                }
            };

            debug!("Process {:?} exited: {:?}", pid, outcome);
            let _ = exit_tx.send(Some(outcome));
            let _ = event_tx.send(ProcessEvent::Exit(outcome));
        });

        Ok((
            ProcessHandle {
                pid,
                exit_rx,
                force_tx,
                kill_grace: self.kill_grace,
            },
            event_rx,
        ))
    }
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(wrap(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(ProcessEvent::Error(format!("Failed to read output: {}", e)));
                break;
            }
        }
    }
}

/// Cloneable handle on a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    force_tx: mpsc::Sender<()>,
    kill_grace: Duration,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last observed exit, without touching the OS
    pub fn try_wait(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// Wait until the exit has been observed
    pub async fn wait(&self) -> Option<ExitOutcome> {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some).await.ok().and_then(|outcome| *outcome)
    }

    /// Ask the process to terminate, escalating to a forced kill after the
    /// grace period. Returns immediately.
    pub fn kill(&self) {
        if self.try_wait().is_some() {
            return;
        }

        let graceful = self.terminate();
        let handle = self.clone();
        let grace = if graceful { self.kill_grace } else { Duration::ZERO };

        tokio::spawn(async move {
            if tokio::time::timeout(grace, handle.wait()).await.is_ok() {
                return;
            }
            warn!(
                "Process {:?} still running after {:?}, forcing kill",
                handle.pid, grace
            );
            handle.force_kill_group();
            let _ = handle.force_tx.try_send(());
        });
    }

    /// Send SIGTERM to the process group; false when no signal could be sent
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                debug!("SIGTERM to process group {} failed: {}", pid, e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn force_kill_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn force_kill_group(&self) {}
}
