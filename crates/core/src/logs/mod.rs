//! Normalized conversation entries, the patch protocol and durable logs

mod entry;
mod log_msg;
mod log_store;
mod patch;

pub use entry::*;
pub use log_msg::LogMsg;
pub use log_store::{ExecutionLogRepository, JsonlLogStore};
pub use patch::{ConversationPatch, ConversationSnapshot, PatchOperation, PatchValue};
