//! Core library for Conductor
//!
//! This crate contains the shared data model and storage boundary:
//! - Execution processes, task attempts and executor sessions
//! - Normalized conversation entries and the patch protocol
//! - Durable per-execution logs

pub mod attempt;
pub mod best_effort;
pub mod error;
pub mod execution;
pub mod logs;
pub mod parse;
pub mod session;
mod table;

pub use best_effort::BestEffort;
pub use error::Error;
pub use parse::Parsed;
pub type Result<T> = std::result::Result<T, Error>;
