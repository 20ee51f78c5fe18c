//! Executor session module
//!
//! Correlates a coding-agent execution with the agent's own session id.

mod file_store;
mod model;
mod repository;

pub use file_store::FileSessionStore;
pub use model::ExecutorSession;
pub use repository::ExecutorSessionRepository;
