//! Log normalization
//!
//! Processors turn raw agent output held in a [`MsgStore`](crate::MsgStore)
//! into normalized entries, pushed back as conversation patches.

mod entry_index;
mod lines;
mod normalizer;
mod plain_text;
mod stream_json;

pub use entry_index::EntryIndexProvider;
pub use normalizer::{spawn_normalizer, LogNormalizer, Normalized, NormalizerHandle};
pub use plain_text::{ClusterThresholds, PlainTextLogProcessor};
pub use stream_json::StreamJsonProcessor;
