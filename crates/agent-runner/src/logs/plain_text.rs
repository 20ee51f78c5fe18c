//! Line-clustering processor for agents without structured output
//!
//! Completed lines are grouped into one entry until a cluster threshold is
//! crossed, which bounds both latency and the number of entries produced by
//! chatty output.

use std::time::Duration;

use conductor_core::logs::{ConversationPatch, NormalizedEntry};
use tokio::time::Instant;

use super::entry_index::EntryIndexProvider;
use super::lines::LineBuffer;

/// When a pending cluster of lines becomes an entry. Whichever limit is hit
/// first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterThresholds {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub max_interval: Duration,
}

impl Default for ClusterThresholds {
    fn default() -> Self {
        Self {
            max_lines: 50,
            max_bytes: 4096,
            max_interval: Duration::from_millis(1000),
        }
    }
}

type EntryProducer = Box<dyn Fn(String) -> NormalizedEntry + Send>;
type LineTransform = Box<dyn Fn(&str) -> String + Send>;

pub struct PlainTextLogProcessor {
    lines: LineBuffer,
    pending: Vec<String>,
    pending_bytes: usize,
    last_emit: Instant,
    thresholds: ClusterThresholds,
    index_provider: EntryIndexProvider,
    producer: EntryProducer,
    transform: Option<LineTransform>,
}

impl PlainTextLogProcessor {
    /// `producer` turns a cluster's joined text into the entry to emit
    pub fn new<F>(producer: F, index_provider: EntryIndexProvider) -> Self
    where
        F: Fn(String) -> NormalizedEntry + Send + 'static,
    {
        Self {
            lines: LineBuffer::default(),
            pending: Vec::new(),
            pending_bytes: 0,
            last_emit: Instant::now(),
            thresholds: ClusterThresholds::default(),
            index_provider,
            producer: Box::new(producer),
            transform: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: ClusterThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Rewrite each line before clustering, e.g. to strip terminal escapes
    pub fn with_line_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }

    /// Feed a chunk of output, returning the entries it completed
    pub fn process(&mut self, chunk: &str) -> Vec<ConversationPatch> {
        let mut patches = Vec::new();
        for line in self.lines.push(chunk) {
            self.push_line(line);
            if self.pending.len() >= self.thresholds.max_lines
                || self.pending_bytes >= self.thresholds.max_bytes
            {
                patches.extend(self.emit());
            }
        }
        patches.extend(self.poll_timeout());
        patches
    }

    /// Emit the pending cluster if it has waited past the time threshold
    pub fn poll_timeout(&mut self) -> Option<ConversationPatch> {
        if !self.pending.is_empty() && self.last_emit.elapsed() >= self.thresholds.max_interval {
            self.emit()
        } else {
            None
        }
    }

    /// End of stream: emit everything still buffered, including an
    /// unterminated last line
    pub fn flush(&mut self) -> Option<ConversationPatch> {
        if let Some(partial) = self.lines.take_partial() {
            self.push_line(partial);
        }
        self.emit()
    }

    fn push_line(&mut self, line: String) {
        let line = match &self.transform {
            Some(transform) => transform(&line),
            None => line,
        };
        self.pending_bytes += line.len() + 1;
        self.pending.push(line);
    }

    fn emit(&mut self) -> Option<ConversationPatch> {
        self.last_emit = Instant::now();
        if self.pending.is_empty() {
            return None;
        }
        let content = std::mem::take(&mut self.pending).join("\n");
        self.pending_bytes = 0;
        let entry = (self.producer)(content);
        Some(ConversationPatch::add_normalized_entry(
            self.index_provider.next(),
            entry,
        ))
    }
}
