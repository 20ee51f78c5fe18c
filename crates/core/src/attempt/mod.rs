//! Task attempt module

mod file_store;
mod model;
mod repository;

pub use file_store::FileAttemptStore;
pub use model::TaskAttempt;
pub use repository::TaskAttemptRepository;
