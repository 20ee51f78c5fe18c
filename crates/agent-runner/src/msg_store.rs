//! Per-execution message store
//!
//! An append-only, replayable, multi-subscriber log of one execution's raw
//! and derived output. Every message gets a sequence number in push order,
//! and subscribers see messages in that order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use conductor_core::logs::{ConversationPatch, LogMsg};
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

/// Bounds on the in-memory history. The durable log keeps everything.
#[derive(Debug, Clone, Copy)]
pub struct MsgStoreLimits {
    pub max_bytes: usize,
    pub max_entries: usize,
}

impl Default for MsgStoreLimits {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
            max_entries: 5000,
        }
    }
}

/// A message with its position in the store
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedMsg {
    pub seq: u64,
    pub msg: LogMsg,
}

type Callback = Arc<dyn Fn(&SequencedMsg) + Send + Sync>;

struct StoredMsg {
    seq: u64,
    msg: LogMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
    next_seq: u64,
    /// Highest `/entries/{n}` add index that fell out of history
    evicted_max_entry_index: Option<usize>,
    finished: bool,
}

/// Retained history at the moment a subscriber was registered
struct Snapshot {
    history: Vec<SequencedMsg>,
    next_seq: u64,
}

pub struct MsgStore {
    inner: RwLock<Inner>,
    /// Held from sequencing a message until every callback has seen it
    dispatch: Mutex<()>,
    subscribers: RwLock<HashMap<u64, Callback>>,
    next_subscriber_id: AtomicU64,
    limits: MsgStoreLimits,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MsgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("MsgStore")
            .field("messages", &inner.history.len())
            .field("next_seq", &inner.next_seq)
            .field("finished", &inner.finished)
            .finish()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        Self::with_limits(MsgStoreLimits::default())
    }

    pub fn with_limits(limits: MsgStoreLimits) -> Self {
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                next_seq: 0,
                evicted_max_entry_index: None,
                finished: false,
            }),
            dispatch: Mutex::new(()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            limits: MsgStoreLimits {
                max_bytes: limits.max_bytes.max(1),
                max_entries: limits.max_entries.max(1),
            },
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and hand it to every subscriber. Pushes after
    /// `Finished` are dropped.
    pub fn push(&self, msg: LogMsg) {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let sequenced = {
            let mut inner = self.write();
            if inner.finished {
                trace!("Dropping {} pushed after finished", msg.name());
                return;
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.finished = msg.is_finished();
            inner.append(seq, msg.clone(), &self.limits);
            SequencedMsg { seq, msg }
        };

        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(&sequenced);
        }
    }

    pub fn push_stdout(&self, s: impl Into<String>) {
        self.push(LogMsg::Stdout(s.into()));
    }

    pub fn push_stderr(&self, s: impl Into<String>) {
        self.push(LogMsg::Stderr(s.into()));
    }

    pub fn push_patch(&self, patch: ConversationPatch) {
        self.push(LogMsg::JsonPatch(patch));
    }

    pub fn push_session_id(&self, session_id: impl Into<String>) {
        self.push(LogMsg::SessionId(session_id.into()));
    }

    pub fn push_finished(&self) {
        self.push(LogMsg::Finished);
    }

    pub fn is_finished(&self) -> bool {
        self.read().finished
    }

    /// Sequence number the next pushed message will get
    pub fn next_seq(&self) -> u64 {
        self.read().next_seq
    }

    /// Retained messages, oldest first
    pub fn history(&self) -> Vec<LogMsg> {
        self.read().history.iter().map(|s| s.msg.clone()).collect()
    }

    pub fn sequenced_history(&self) -> Vec<SequencedMsg> {
        self.read()
            .history
            .iter()
            .map(|s| SequencedMsg {
                seq: s.seq,
                msg: s.msg.clone(),
            })
            .collect()
    }

    /// Highest entry index ever added, including evicted history
    pub fn max_entry_index(&self) -> Option<usize> {
        let inner = self.read();
        inner
            .history
            .iter()
            .filter_map(|s| match &s.msg {
                LogMsg::JsonPatch(patch) => patch.added_indices().max(),
                _ => None,
            })
            .chain(inner.evicted_max_entry_index)
            .max()
    }

    /// Call `callback` for every message pushed from now on, synchronously
    /// and in push order. The callback must not push to this store.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&SequencedMsg) + Send + Sync + 'static,
    {
        self.subscribe_with_snapshot(callback).1
    }

    /// Register `callback` and take the retained history in one step, so
    /// every message is either in the snapshot or passed to the callback.
    fn subscribe_with_snapshot<F>(self: &Arc<Self>, callback: F) -> (Snapshot, Subscription)
    where
        F: Fn(&SequencedMsg) + Send + Sync + 'static,
    {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = Snapshot {
            history: self.sequenced_history(),
            next_seq: self.next_seq(),
        };
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        let subscription = Subscription {
            store: Arc::downgrade(self),
            id,
        };
        (snapshot, subscription)
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Retained history followed by live pushes, ending after `Finished`.
    /// Dropping the stream drops its subscription.
    pub fn history_plus_stream(self: &Arc<Self>) -> BoxStream<'static, SequencedMsg> {
        self.history_plus_stream_at().1
    }

    /// [`history_plus_stream`](Self::history_plus_stream), together with the
    /// sequence number of the first message it yields. Anything before that
    /// was evicted from memory.
    pub fn history_plus_stream_at(self: &Arc<Self>) -> (u64, BoxStream<'static, SequencedMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot, subscription) = self.subscribe_with_snapshot(move |msg| {
            let _ = tx.send(msg.clone());
        });
        let first_seq = snapshot
            .history
            .first()
            .map_or(snapshot.next_seq, |m| m.seq);

        let stream = stream::iter(snapshot.history)
            .chain(UnboundedReceiverStream::new(rx))
            .scan((false, subscription), |(done, _subscription), item| {
                if *done {
                    return future::ready(None);
                }
                *done = item.msg.is_finished();
                future::ready(Some(item))
            })
            .boxed();
        (first_seq, stream)
    }
}

impl Inner {
    fn append(&mut self, seq: u64, msg: LogMsg, limits: &MsgStoreLimits) {
        let bytes = msg.approx_bytes();
        while self.history.len() >= limits.max_entries
            || (!self.history.is_empty() && self.total_bytes.saturating_add(bytes) > limits.max_bytes)
        {
            let Some(front) = self.history.pop_front() else {
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(front.bytes);
            if let LogMsg::JsonPatch(patch) = &front.msg {
                if let Some(max) = patch.added_indices().max() {
                    self.evicted_max_entry_index =
                        Some(self.evicted_max_entry_index.map_or(max, |m| m.max(max)));
                }
            }
        }
        self.history.push_back(StoredMsg { seq, msg, bytes });
        self.total_bytes = self.total_bytes.saturating_add(bytes);
    }
}

/// Handle returned by [`MsgStore::subscribe`]. Unsubscribes when dropped.
#[derive(Debug)]
pub struct Subscription {
    store: Weak<MsgStore>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}
