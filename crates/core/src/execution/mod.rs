//! Execution process module
//!
//! One tracked spawn of a script, coding agent or dev server.

mod action;
mod file_store;
mod model;
mod repository;

pub use action::*;
pub use file_store::FileExecutionStore;
pub use model::*;
pub use repository::ExecutionProcessRepository;
