//! Normalization driver
//!
//! One task per execution tails the MsgStore, dispatches stdout and stderr
//! to the processors in push order and pushes the resulting patches back.
//! All processor state lives inside that task.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use conductor_core::execution::{HistoryStrategy, LogFormat};
use conductor_core::logs::{ConversationPatch, LogMsg, NormalizedEntry};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry_index::EntryIndexProvider;
use super::plain_text::{ClusterThresholds, PlainTextLogProcessor};
use super::stream_json::StreamJsonProcessor;
use crate::msg_store::MsgStore;

static STDERR_SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)session[ _-]?id\s*[:=]\s*([A-Za-z0-9][A-Za-z0-9_-]*)").expect("valid regex")
});

/// Output of one processing step
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Normalized {
    pub patches: Vec<ConversationPatch>,
    pub session_id: Option<String>,
}

impl Normalized {
    pub fn extend(&mut self, other: Normalized) {
        self.patches.extend(other.patches);
        if self.session_id.is_none() {
            self.session_id = other.session_id;
        }
    }

    fn push(&mut self, patch: Option<ConversationPatch>) {
        self.patches.extend(patch);
    }
}

enum StdoutProcessor {
    PlainText(PlainTextLogProcessor),
    StreamJson(StreamJsonProcessor),
}

/// Synchronous normalization state for one execution
pub struct LogNormalizer {
    stdout: StdoutProcessor,
    stderr: PlainTextLogProcessor,
    session_reported: bool,
}

impl LogNormalizer {
    pub fn new(
        format: LogFormat,
        strategy: HistoryStrategy,
        worktree_path: &Path,
        index_provider: EntryIndexProvider,
        thresholds: ClusterThresholds,
    ) -> Self {
        let stdout = match format {
            LogFormat::StructuredJson => StdoutProcessor::StreamJson(StreamJsonProcessor::new(
                index_provider.clone(),
                strategy,
                worktree_path,
            )),
            LogFormat::PlainText => StdoutProcessor::PlainText(
                PlainTextLogProcessor::new(NormalizedEntry::assistant, index_provider.clone())
                    .with_thresholds(thresholds),
            ),
        };
        let stderr = PlainTextLogProcessor::new(NormalizedEntry::error, index_provider)
            .with_thresholds(thresholds)
            .with_line_transform(|line| strip_ansi_escapes::strip_str(line));

        Self {
            stdout,
            stderr,
            session_reported: false,
        }
    }

    pub fn on_stdout(&mut self, chunk: &str) -> Normalized {
        let out = match &mut self.stdout {
            StdoutProcessor::StreamJson(p) => p.process(chunk),
            StdoutProcessor::PlainText(p) => Normalized {
                patches: p.process(chunk),
                session_id: None,
            },
        };
        self.dedupe_session(out)
    }

    pub fn on_stderr(&mut self, chunk: &str) -> Normalized {
        let session_id = STDERR_SESSION_ID
            .captures(chunk)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        let out = Normalized {
            patches: self.stderr.process(chunk),
            session_id,
        };
        self.dedupe_session(out)
    }

    /// Time-based cluster emission for plain-text output
    pub fn on_tick(&mut self) -> Normalized {
        let mut out = Normalized::default();
        if let StdoutProcessor::PlainText(p) = &mut self.stdout {
            out.push(p.poll_timeout());
        }
        out.push(self.stderr.poll_timeout());
        out
    }

    /// End of input: flush partial lines and pending clusters
    pub fn finish(&mut self) -> Normalized {
        let mut out = match &mut self.stdout {
            StdoutProcessor::StreamJson(p) => p.flush(),
            StdoutProcessor::PlainText(p) => Normalized {
                patches: p.flush().into_iter().collect(),
                session_id: None,
            },
        };
        out.push(self.stderr.flush());
        self.dedupe_session(out)
    }

    fn dedupe_session(&mut self, mut out: Normalized) -> Normalized {
        if out.session_id.is_some() {
            if self.session_reported {
                out.session_id = None;
            } else {
                self.session_reported = true;
            }
        }
        out
    }
}

/// Controls a running normalizer task
#[derive(Debug)]
pub struct NormalizerHandle {
    finish_tx: watch::Sender<Option<u64>>,
    join: JoinHandle<()>,
}

impl NormalizerHandle {
    /// Let the normalizer catch up with everything pushed so far, flush,
    /// and wait for it to stop. Call before pushing `Finished`.
    pub async fn finish(self, msg_store: &MsgStore) {
        let _ = self.finish_tx.send(Some(msg_store.next_seq()));
        if let Err(e) = self.join.await {
            warn!("Log normalizer task failed: {}", e);
        }
    }
}

/// Start normalizing `msg_store` in a background task
pub fn spawn_normalizer(
    msg_store: Arc<MsgStore>,
    format: LogFormat,
    strategy: HistoryStrategy,
    worktree_path: &Path,
    thresholds: ClusterThresholds,
) -> NormalizerHandle {
    let index_provider = EntryIndexProvider::start_from(&msg_store);
    let mut normalizer =
        LogNormalizer::new(format, strategy, worktree_path, index_provider, thresholds);
    let (finish_tx, mut finish_rx) = watch::channel(None::<u64>);
    // Subscribe before returning so nothing pushed from here on can be missed
    let mut stream = msg_store.history_plus_stream();

    let join = tokio::spawn(async move {
        let mut tick = tokio::time::interval(thresholds.max_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Sequence number up to which input must be consumed before stopping
        let mut finish_at: Option<u64> = None;
        let mut consumed: u64 = 0;

        loop {
            if finish_at.is_some_and(|at| consumed >= at) {
                break;
            }

            tokio::select! {
                biased;

                item = stream.next() => {
                    let Some(item) = item else { break };
                    consumed = item.seq + 1;
                    let out = match &item.msg {
                        LogMsg::Stdout(chunk) => normalizer.on_stdout(chunk),
                        LogMsg::Stderr(chunk) => normalizer.on_stderr(chunk),
                        LogMsg::Finished => break,
                        LogMsg::JsonPatch(_) | LogMsg::SessionId(_) => continue,
                    };
                    apply(&msg_store, out);
                }
                changed = finish_rx.changed(), if finish_at.is_none() => {
                    finish_at = match changed {
                        Ok(()) => *finish_rx.borrow(),
                        // Handle dropped without finishing: stop at what exists now
                        Err(_) => Some(msg_store.next_seq()),
                    };
                }
                _ = tick.tick() => {
                    apply(&msg_store, normalizer.on_tick());
                }
            }
        }

        apply(&msg_store, normalizer.finish());
        debug!("Log normalizer stopped after {} messages", consumed);
    });

    NormalizerHandle { finish_tx, join }
}

fn apply(msg_store: &MsgStore, out: Normalized) {
    for patch in out.patches {
        msg_store.push_patch(patch);
    }
    if let Some(session_id) = out.session_id {
        msg_store.push_session_id(session_id);
    }
}
