use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use strand_types::api::{HistoryEntry, InboundRecord, ThreadSummary};
use strand_types::models::{ChatThread, Direction, Message, MessageId, ThreadId, UserId, UserRef};

use crate::backend::Backend;
use crate::dedup::{Admission, Deduplicator, EchoKey, normalize_body, time_bucket};
use crate::error::{BackendError, Resource, SyncError, SyncResult};
use crate::status::{Source, StatusBoard, SyncUpdate};

/// A message as delivered by push, poll or history, before it joins a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub server_id: Option<MessageId>,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn from_history(thread_id: &ThreadId, entry: HistoryEntry) -> Self {
        Self {
            server_id: entry.id,
            thread_id: thread_id.clone(),
            sender_id: entry.sender_id,
            body: entry.body,
            timestamp: entry.timestamp,
        }
    }

    fn into_message(self, me: &UserId) -> Message {
        let direction = if self.sender_id == *me {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        Message {
            local_id: Uuid::new_v4(),
            server_id: self.server_id,
            thread_id: Some(self.thread_id),
            sender_id: self.sender_id,
            body: self.body,
            timestamp: self.timestamp,
            direction,
        }
    }
}

impl From<InboundRecord> for InboundMessage {
    fn from(record: InboundRecord) -> Self {
        Self {
            server_id: record.id,
            thread_id: record.thread_id,
            sender_id: record.sender_id,
            body: record.body,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Duplicate,
    /// Server copy of a local optimistic send; already displayed.
    Echo,
    /// Appended to the active thread; the pane must scroll.
    AppendedActive,
    /// Appended to a loaded background thread and flagged unseen.
    AppendedBackground,
    MarkedUnseen,
    /// No local thread matches; the thread list needs a refresh.
    UnknownThread,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied { messages: usize },
    /// The thread is no longer the requested one, or the store is closed.
    Discarded,
    Failed(SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub local_id: Uuid,
    pub thread_id: ThreadId,
    /// True when this send created the thread.
    pub created: bool,
}

struct PendingSend {
    local_id: Uuid,
    echo: EchoKey,
}

#[derive(Default)]
struct ThreadState {
    threads: Vec<ChatThread>,
    /// Active thread, addressed by peer.
    active: Option<UserId>,
    /// History load the active thread is waiting for.
    requested: Option<ThreadId>,
    loaded: HashSet<ThreadId>,
    pending: Vec<PendingSend>,
    /// Local ids of every optimistic message sent this session.
    sent: HashSet<Uuid>,
    /// Last "pending" hint seen per peer in a server thread list.
    hints: HashMap<UserId, bool>,
    /// Peer to select instead of the first thread when nothing is active.
    preferred: Option<UserId>,
    closed: bool,
}

impl ThreadState {
    fn position(&self, peer: &UserId) -> Option<usize> {
        self.threads.iter().position(|t| t.peer.id == *peer)
    }

    fn position_by_id(&self, id: &ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| t.id.as_ref() == Some(id))
    }

    fn is_active(&self, idx: usize) -> bool {
        self.active.as_ref() == Some(&self.threads[idx].peer.id)
    }

    fn confirm_echo(&mut self, echo: &EchoKey) {
        if let Some(pos) = self.pending.iter().position(|p| p.echo == *echo) {
            let confirmed = self.pending.remove(pos);
            trace!(local_id = %confirmed.local_id, "optimistic send confirmed");
        }
    }

    fn is_pending(&self, local_id: Uuid) -> bool {
        self.pending.iter().any(|p| p.local_id == local_id)
    }

    /// Point the active thread at `idx`. Returns the history to load, if any.
    fn activate(&mut self, idx: usize) -> Option<ThreadId> {
        let thread = &mut self.threads[idx];
        thread.has_unseen = false;
        let peer = thread.peer.id.clone();
        let request = thread
            .id
            .clone()
            .filter(|id| thread.messages.is_empty() || !self.loaded.contains(id));
        self.active = Some(peer);
        self.requested = request.clone();
        request
    }
}

fn equivalent(a: &Message, b: &Message, bucket: std::time::Duration) -> bool {
    match (&a.server_id, &b.server_id) {
        (Some(x), Some(y)) => x == y,
        _ => {
            a.sender_id == b.sender_id
                && time_bucket(a.timestamp, bucket) == time_bucket(b.timestamp, bucket)
                && normalize_body(&a.body) == normalize_body(&b.body)
        }
    }
}

/// Chat threads, the active thread pointer and per-thread message order.
///
/// All mutations go through one write lock; reads clone a snapshot. Network
/// calls are made with no lock held and their results are checked against the
/// state at apply time.
pub struct ThreadStore {
    me: UserRef,
    backend: Arc<dyn Backend>,
    dedup: Arc<Deduplicator>,
    board: Arc<StatusBoard>,
    state: RwLock<ThreadState>,
    send_gates: StdMutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl ThreadStore {
    pub fn new(
        me: UserRef,
        backend: Arc<dyn Backend>,
        dedup: Arc<Deduplicator>,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            me,
            backend,
            dedup,
            board,
            state: RwLock::new(ThreadState::default()),
            send_gates: StdMutex::new(HashMap::new()),
        }
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    /// Select `peer` on the next thread list merge if nothing is active yet.
    pub async fn prefer(&self, peer: UserId) {
        self.state.write().await.preferred = Some(peer);
    }

    // -- Reads --

    pub async fn threads(&self) -> Vec<ChatThread> {
        self.state.read().await.threads.clone()
    }

    pub async fn thread(&self, peer: &UserId) -> Option<ChatThread> {
        let state = self.state.read().await;
        state.position(peer).map(|idx| state.threads[idx].clone())
    }

    pub async fn active_thread(&self) -> Option<ChatThread> {
        let state = self.state.read().await;
        let peer = state.active.as_ref()?;
        state.position(peer).map(|idx| state.threads[idx].clone())
    }

    pub async fn active_peer(&self) -> Option<UserId> {
        self.state.read().await.active.clone()
    }

    pub async fn active_thread_id(&self) -> Option<ThreadId> {
        let state = self.state.read().await;
        let peer = state.active.as_ref()?;
        state.position(peer).and_then(|idx| state.threads[idx].id.clone())
    }

    // -- Inbound --

    /// Merge one delivered message into the thread set.
    pub async fn apply_inbound(&self, msg: InboundMessage) -> InboundOutcome {
        let mut state = self.state.write().await;
        if state.closed {
            return InboundOutcome::Closed;
        }

        let me = self.me.id.clone();
        let idx = state.position_by_id(&msg.thread_id).or_else(|| {
            // A peer may open the thread before our list knows its id
            (msg.sender_id != me)
                .then(|| {
                    state
                        .threads
                        .iter()
                        .position(|t| t.id.is_none() && t.peer.id == msg.sender_id)
                })
                .flatten()
        });
        let Some(idx) = idx else {
            // not recorded as seen, so a later copy still lands once the thread is known
            info!("Message for unknown thread {}, thread list refresh needed", msg.thread_id);
            return InboundOutcome::UnknownThread;
        };

        let keys = self.dedup.message_keys(
            msg.thread_id.as_str(),
            msg.server_id.as_ref().map(MessageId::as_str),
            &msg.sender_id,
            &msg.body,
            msg.timestamp,
        );
        let partner = state.threads[idx].peer.id.clone();
        match self.dedup.admit_message(&keys, &partner, &msg.sender_id, &msg.body) {
            Admission::Duplicate => {
                trace!(thread = %msg.thread_id, "duplicate delivery suppressed");
                return InboundOutcome::Duplicate;
            }
            Admission::Echo(echo) => {
                state.confirm_echo(&echo);
                debug!(thread = %msg.thread_id, "echo of optimistic send collapsed");
                return InboundOutcome::Echo;
            }
            Admission::New => {}
        }

        let is_active = state.is_active(idx);
        let bucket = self.dedup.bucket();
        let loaded = state
            .threads[idx]
            .id
            .as_ref()
            .is_some_and(|id| state.loaded.contains(id));
        let thread = &mut state.threads[idx];
        if thread.id.is_none() {
            info!("Thread with {} adopted id {}", thread.peer.id, msg.thread_id);
            thread.id = Some(msg.thread_id.clone());
        }
        let peer = thread.peer.id.clone();
        let message = msg.into_message(&me);
        if thread.messages.iter().any(|m| equivalent(m, &message, bucket)) {
            trace!(peer = %peer, "message already present in thread");
            return InboundOutcome::Duplicate;
        }

        if is_active {
            thread.insert_ordered(message);
            drop(state);
            self.board.publish(SyncUpdate::MessagesChanged { peer });
            self.board.publish(SyncUpdate::Autoscroll { force: true });
            return InboundOutcome::AppendedActive;
        }

        thread.has_unseen = true;
        let outcome = if loaded {
            thread.insert_ordered(message);
            InboundOutcome::AppendedBackground
        } else {
            if thread.last_activity_at.is_none_or(|at| at < message.timestamp) {
                thread.last_activity_at = Some(message.timestamp);
            }
            InboundOutcome::MarkedUnseen
        };
        drop(state);
        if outcome == InboundOutcome::AppendedBackground {
            self.board.publish(SyncUpdate::MessagesChanged { peer });
        }
        self.board.publish(SyncUpdate::ThreadsChanged);
        outcome
    }

    /// Merge a server thread list. Returns a history load the active thread now needs.
    pub async fn apply_thread_list(&self, summaries: Vec<ThreadSummary>) -> Option<ThreadId> {
        let mut state = self.state.write().await;
        if state.closed {
            return None;
        }

        let mut previous = std::mem::take(&mut state.threads);
        let mut merged = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let peer_id = summary.other_user_id.clone();
            let mut thread = match previous.iter().position(|t| t.peer.id == peer_id) {
                Some(pos) => previous.remove(pos),
                None => ChatThread::new(self.me.id.clone(), summary.peer(), None),
            };
            thread.peer = summary.peer();

            match (&thread.id, &summary.thread_id) {
                (None, Some(id)) => thread.id = Some(id.clone()),
                (Some(local), Some(remote)) if local != remote => {
                    warn!("Thread with {} moved from {} to {}", peer_id, local, remote);
                    state.loaded.remove(local);
                    thread.id = Some(remote.clone());
                    thread.messages.clear();
                }
                _ => {}
            }

            let was_hinted = state.hints.insert(peer_id.clone(), summary.has_pending);
            let is_active = state.active.as_ref() == Some(&peer_id);
            if summary.has_pending && was_hinted != Some(true) && !is_active {
                thread.has_unseen = true;
            }
            merged.push(thread);
        }

        for thread in previous {
            match &thread.id {
                None => merged.push(thread),
                Some(id) => {
                    info!("Thread {} with {} vanished from server list", id, thread.peer.id);
                    state.loaded.remove(id);
                    if state.active.as_ref() == Some(&thread.peer.id) {
                        state.active = None;
                        state.requested = None;
                    }
                }
            }
        }
        state.threads = merged;

        let history = match state.active.clone() {
            None if !state.threads.is_empty() => {
                let idx = state
                    .preferred
                    .take()
                    .and_then(|peer| state.position(&peer))
                    .unwrap_or(0);
                let history = state.activate(idx);
                let peer = state.threads[idx].peer.id.clone();
                debug!(peer = %peer, "auto-selected thread");
                self.board.publish(SyncUpdate::ActiveThreadChanged { peer });
                history
            }
            Some(peer) => state.position(&peer).and_then(|idx| {
                let id = state.threads[idx].id.clone()?;
                let needs = !state.loaded.contains(&id) && state.requested.as_ref() != Some(&id);
                needs.then(|| {
                    state.requested = Some(id.clone());
                    id
                })
            }),
            None => None,
        };
        drop(state);
        self.board.publish(SyncUpdate::ThreadsChanged);
        history
    }

    /// Admit a polled history of `thread_id` entry by entry, inserting only
    /// messages not seen before. Returns how many were new.
    pub async fn reconcile(&self, thread_id: &ThreadId, entries: Vec<HistoryEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            match self
                .apply_inbound(InboundMessage::from_history(thread_id, entry))
                .await
            {
                InboundOutcome::AppendedActive
                | InboundOutcome::AppendedBackground
                | InboundOutcome::MarkedUnseen => added += 1,
                InboundOutcome::Closed => break,
                _ => {}
            }
        }
        if added > 0 {
            debug!(thread = %thread_id, added, "reconciled missed messages");
        }
        added
    }

    // -- Selection --

    pub async fn select_thread(&self, peer: &UserId) -> SyncResult<Option<ThreadId>> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(SyncError::Stopped);
        }
        let idx = state.position(peer).ok_or_else(|| SyncError::NotFound {
            resource: Resource::Thread,
            id: peer.to_string(),
        })?;
        let history = state.activate(idx);
        drop(state);
        self.board.publish(SyncUpdate::ActiveThreadChanged { peer: peer.clone() });
        self.board.publish(SyncUpdate::ThreadsChanged);
        Ok(history)
    }

    /// Select `user`, creating an empty thread (no id yet) when none exists.
    pub async fn open_thread(&self, user: &UserRef) -> SyncResult<Option<ThreadId>> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(SyncError::Stopped);
        }
        let idx = match state.position(&user.id) {
            Some(idx) => idx,
            None => {
                state
                    .threads
                    .push(ChatThread::new(self.me.id.clone(), user.clone(), None));
                state.threads.len() - 1
            }
        };
        let history = state.activate(idx);
        drop(state);
        self.board.publish(SyncUpdate::ActiveThreadChanged {
            peer: user.id.clone(),
        });
        self.board.publish(SyncUpdate::ThreadsChanged);
        Ok(history)
    }

    // -- History --

    pub async fn load_history(&self, thread_id: &ThreadId) -> HistoryOutcome {
        match self.backend.get_thread_history(thread_id).await {
            Ok(entries) => {
                self.board.recover(Source::History);
                self.apply_history(thread_id, entries).await
            }
            Err(err) => {
                if let BackendError::NotFound {
                    resource: Resource::Thread,
                    ..
                } = &err
                {
                    self.drop_thread(thread_id).await;
                } else {
                    self.board.stall(Source::History, &err);
                }
                HistoryOutcome::Failed(err.into())
            }
        }
    }

    /// Apply a loaded history if `thread_id` is still the requested thread.
    pub async fn apply_history(&self, thread_id: &ThreadId, entries: Vec<HistoryEntry>) -> HistoryOutcome {
        let mut state = self.state.write().await;
        if state.closed {
            return HistoryOutcome::Discarded;
        }
        if state.requested.as_ref() != Some(thread_id) {
            debug!("History for {} arrived after a thread switch, discarding", thread_id);
            return HistoryOutcome::Discarded;
        }
        let Some(idx) = state.position_by_id(thread_id) else {
            return HistoryOutcome::Discarded;
        };

        let me = self.me.id.clone();
        let partner = state.threads[idx].peer.id.clone();
        let bucket = self.dedup.bucket();
        let mut history = Vec::with_capacity(entries.len());
        for entry in entries {
            let msg = InboundMessage::from_history(thread_id, entry);
            let keys = self.dedup.message_keys(
                thread_id.as_str(),
                msg.server_id.as_ref().map(MessageId::as_str),
                &msg.sender_id,
                &msg.body,
                msg.timestamp,
            );
            if let Admission::Echo(echo) =
                self.dedup.admit_message(&keys, &partner, &msg.sender_id, &msg.body)
            {
                state.confirm_echo(&echo);
            }
            history.push(msg.into_message(&me));
        }

        let carried: Vec<Message> = state.threads[idx]
            .messages
            .iter()
            .filter(|m| {
                if state.sent.contains(&m.local_id) {
                    state.is_pending(m.local_id)
                        || !history.iter().any(|h| {
                            h.sender_id == me && normalize_body(&h.body) == normalize_body(&m.body)
                        })
                } else {
                    !history.iter().any(|h| equivalent(h, m, bucket))
                }
            })
            .cloned()
            .collect();

        let thread = &mut state.threads[idx];
        thread.messages.clear();
        for message in history.into_iter().chain(carried) {
            thread.insert_ordered(message);
        }
        let count = thread.messages.len();
        let peer = thread.peer.id.clone();
        state.loaded.insert(thread_id.clone());
        state.requested = None;
        drop(state);

        debug!(thread = %thread_id, count, "history applied");
        self.board.publish(SyncUpdate::MessagesChanged { peer });
        self.board.publish(SyncUpdate::Autoscroll { force: true });
        HistoryOutcome::Applied { messages: count }
    }

    async fn drop_thread(&self, thread_id: &ThreadId) {
        let mut state = self.state.write().await;
        if state.closed {
            return;
        }
        let Some(idx) = state.position_by_id(thread_id) else {
            return;
        };
        let thread = state.threads.remove(idx);
        info!("Thread {} with {} no longer exists, removed", thread_id, thread.peer.id);
        state.loaded.remove(thread_id);
        if state.active.as_ref() == Some(&thread.peer.id) {
            state.active = None;
            state.requested = None;
        }
        drop(state);
        self.board.publish(SyncUpdate::ThreadsChanged);
    }

    // -- Send --

    fn gate(&self, peer: &UserId) -> Arc<Mutex<()>> {
        let mut gates = self.send_gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.entry(peer.clone()).or_default().clone()
    }

    /// Send `body` to `to`, creating the thread on first send.
    ///
    /// The message is shown immediately as outbound and is not rolled back if
    /// the backend call fails. Sends to the same peer are serialized, so a
    /// second send issued before the thread exists waits for the first
    /// `create_thread` and then appends to the adopted id.
    pub async fn send(&self, to: &UserRef, body: &str) -> SyncResult<SendReceipt> {
        if body.trim().is_empty() {
            return Err(SyncError::Validation("message body is empty".to_string()));
        }
        let gate = self.gate(&to.id);
        let _turn = gate.lock().await;

        let (thread_id, local_id) = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(SyncError::Stopped);
            }
            let idx = match state.position(&to.id) {
                Some(idx) => idx,
                None => {
                    state
                        .threads
                        .push(ChatThread::new(self.me.id.clone(), to.clone(), None));
                    state.threads.len() - 1
                }
            };
            let local_id = Uuid::new_v4();
            let thread = &mut state.threads[idx];
            let thread_id = thread.id.clone();
            thread.insert_ordered(Message {
                local_id,
                server_id: None,
                thread_id: thread_id.clone(),
                sender_id: self.me.id.clone(),
                body: body.to_string(),
                timestamp: Utc::now(),
                direction: Direction::Outbound,
            });
            let echo = self.dedup.expect_echo(&to.id, &self.me.id, body);
            state.pending.push(PendingSend { local_id, echo });
            state.sent.insert(local_id);
            (thread_id, local_id)
        };
        self.board.publish(SyncUpdate::MessagesChanged { peer: to.id.clone() });
        self.board.publish(SyncUpdate::Autoscroll { force: true });

        let result = match &thread_id {
            None => self.backend.create_thread(&self.me.id, &to.id, body).await,
            Some(id) => self.backend.append_message(id, &self.me.id, &to.id, body).await,
        };

        match result {
            Ok(ack) => {
                let mut state = self.state.write().await;
                if !state.closed {
                    let mut adopted = false;
                    if let Some(idx) = state.position(&to.id) {
                        let thread = &mut state.threads[idx];
                        match &thread.id {
                            None => {
                                info!("Thread {} created with {}", ack.thread_id, to.id);
                                thread.id = Some(ack.thread_id.clone());
                                thread.has_unseen = false;
                                adopted = true;
                            }
                            Some(current) if *current != ack.thread_id => {
                                warn!("Backend echoed thread {} for {}, expected {}", ack.thread_id, to.id, current);
                                thread.id = Some(ack.thread_id.clone());
                            }
                            Some(_) => {}
                        }
                        for message in thread.messages.iter_mut().filter(|m| m.thread_id.is_none()) {
                            message.thread_id = Some(ack.thread_id.clone());
                        }
                    }
                    // a freshly created thread becomes the open conversation
                    let switched = adopted && state.active.as_ref() != Some(&to.id);
                    if adopted {
                        state.loaded.insert(ack.thread_id.clone());
                        state.active = Some(to.id.clone());
                        state.requested = None;
                    }
                    drop(state);
                    if switched {
                        self.board.publish(SyncUpdate::ActiveThreadChanged { peer: to.id.clone() });
                    }
                    self.board.publish(SyncUpdate::ThreadsChanged);
                }
                Ok(SendReceipt {
                    local_id,
                    thread_id: ack.thread_id,
                    created: thread_id.is_none(),
                })
            }
            Err(err) => {
                warn!(peer = %to.id, error = %err, "send failed, optimistic copy kept");
                if let (BackendError::NotFound { resource: Resource::Thread, .. }, Some(stale)) =
                    (&err, &thread_id)
                {
                    let mut state = self.state.write().await;
                    if !state.closed {
                        if let Some(idx) = state.position_by_id(stale) {
                            state.loaded.remove(stale);
                            state.threads[idx].id = None;
                        }
                        drop(state);
                        self.board.publish(SyncUpdate::ThreadsChanged);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Stop accepting mutations. Results arriving later are discarded.
    pub async fn close(&self) {
        self.state.write().await.closed = true;
    }
}
