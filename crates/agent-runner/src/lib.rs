//! Agent Runner - execution lifecycle for agent runs in isolated worktrees
//!
//! This crate spawns coding agents and scripts inside per-attempt
//! containers (git worktrees), captures their output in replayable message
//! stores and normalizes it into conversation patches for live consumers.

mod agents;
mod container;
mod error;
mod event;
mod expiry;
pub mod logs;
mod manager;
mod msg_store;
mod process;
mod shell;

pub use agents::{agent_command_line, build_process_spec};
pub use container::{ContainerService, WorktreeContainerService};
pub use error::{ExecutorError, Result};
pub use event::LifecycleEvent;
pub use expiry::{select_expired_attempts, DEFAULT_WORKTREE_TTL_HOURS};
pub use manager::{run_reason_for, ExecutionManager, ExecutionManagerConfig, Repositories};
pub use msg_store::{MsgStore, MsgStoreLimits, SequencedMsg, Subscription};
pub use process::{
    ExitOutcome, ProcessEvent, ProcessHandle, ProcessRunner, ProcessSpec, DEFAULT_KILL_GRACE,
};
pub use shell::{get_shell_command, resolve_executable_path, shell_quote};
