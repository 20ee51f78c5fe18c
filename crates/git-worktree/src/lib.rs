//! Git Worktree management library
//!
//! This crate provides functionality for managing Git worktrees,
//! giving every task attempt its own isolated working directory.

mod commands;
mod error;
mod worktree;

pub use commands::DiffStream;
pub use error::{Result, WorktreeError};
pub use worktree::{Worktree, WorktreeConfig, WorktreeManager, WorktreeStatus};
