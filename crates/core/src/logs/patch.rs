//! Conversation patch protocol
//!
//! A batch of `add`/`replace`/`remove` operations addressing
//! `/entries/{n}`. Live consumers apply these incrementally; replaying the
//! whole sequence onto an empty document rebuilds the conversation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::entry::NormalizedEntry;
use crate::{Error, Result};

const ENTRIES_PREFIX: &str = "/entries/";

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type", content = "content")]
pub enum PatchValue {
    NormalizedEntry(NormalizedEntry),
    Stdout(String),
    Stderr(String),
    Diff(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: PatchValue },
    Replace { path: String, value: PatchValue },
    Remove { path: String },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }

    /// Entry index addressed by this operation, if the path is well formed
    pub fn entry_index(&self) -> Option<usize> {
        self.path().strip_prefix(ENTRIES_PREFIX)?.parse().ok()
    }
}

/// An ordered batch of patch operations
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationPatch(pub Vec<PatchOperation>);

fn entry_path(index: usize) -> String {
    format!("{ENTRIES_PREFIX}{index}")
}

impl ConversationPatch {
    pub fn add_normalized_entry(index: usize, entry: NormalizedEntry) -> Self {
        Self::add(index, PatchValue::NormalizedEntry(entry))
    }

    pub fn replace(index: usize, entry: NormalizedEntry) -> Self {
        Self(vec![PatchOperation::Replace {
            path: entry_path(index),
            value: PatchValue::NormalizedEntry(entry),
        }])
    }

    pub fn remove(index: usize) -> Self {
        Self(vec![PatchOperation::Remove {
            path: entry_path(index),
        }])
    }

    fn add(index: usize, value: PatchValue) -> Self {
        Self(vec![PatchOperation::Add {
            path: entry_path(index),
            value,
        }])
    }

    pub fn ops(&self) -> &[PatchOperation] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append another batch, keeping order
    pub fn extend(&mut self, other: ConversationPatch) {
        self.0.extend(other.0);
    }

    /// Indices introduced by `add` operations in this batch
    pub fn added_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().filter_map(|op| match op {
            PatchOperation::Add { .. } => op.entry_index(),
            _ => None,
        })
    }

    /// The last normalized entry carried by an add or replace, with its index
    pub fn normalized_entry(&self) -> Option<(usize, &NormalizedEntry)> {
        self.0.iter().rev().find_map(|op| match op {
            PatchOperation::Add {
                value: PatchValue::NormalizedEntry(entry),
                ..
            }
            | PatchOperation::Replace {
                value: PatchValue::NormalizedEntry(entry),
                ..
            } => op.entry_index().map(|i| (i, entry)),
            _ => None,
        })
    }
}

/// The conversation document obtained by applying patches in order
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    doc: Value,
}

impl Default for ConversationSnapshot {
    fn default() -> Self {
        Self {
            doc: json!({ "entries": [] }),
        }
    }
}

impl ConversationSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, patch: &ConversationPatch) -> Result<()> {
        let ops: json_patch::Patch = serde_json::from_value(serde_json::to_value(patch)?)?;
        json_patch::patch(&mut self.doc, &ops)
            .map_err(|e| Error::InvalidInput(format!("Patch does not apply: {}", e)))
    }

    pub fn entries(&self) -> Result<Vec<PatchValue>> {
        Ok(serde_json::from_value(self.doc["entries"].clone())?)
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }
}
