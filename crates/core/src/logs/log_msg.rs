//! Messages carried by an execution's message store and durable log

use serde::{Deserialize, Serialize};

use super::patch::ConversationPatch;

/// One message in an execution's output history.
///
/// Serialized one per line in the durable log, e.g.
/// `{"type":"stdout","content":"..."}` or `{"type":"finished"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum LogMsg {
    Stdout(String),
    Stderr(String),
    JsonPatch(ConversationPatch),
    SessionId(String),
    Finished,
}

impl LogMsg {
    /// Event name used on the live stream
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::Stderr(_) => "stderr",
            Self::JsonPatch(_) => "json_patch",
            Self::SessionId(_) => "session_id",
            Self::Finished => "finished",
        }
    }

    /// Rough in-memory footprint, used to bound history
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 8;
        match self {
            Self::Stdout(s) | Self::Stderr(s) | Self::SessionId(s) => s.len() + OVERHEAD,
            Self::JsonPatch(patch) => serde_json::to_string(patch)
                .map(|s| s.len())
                .unwrap_or(0)
                + OVERHEAD,
            Self::Finished => OVERHEAD,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}
