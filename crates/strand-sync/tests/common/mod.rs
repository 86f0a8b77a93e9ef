//! In-memory collaborators for engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Notify, mpsc};

use strand_sync::backend::{Backend, PushLink, PushTransport};
use strand_sync::error::{BackendError, Resource};
use strand_types::api::{
    CommentRecord, FeedRecord, FeedRequest, HistoryEntry, InboundRecord, LikeRecord, ThreadAck,
    ThreadSummary,
};
use strand_types::events::{PushCommand, PushEvent};
use strand_types::models::{CommentId, MessageId, PostId, ThreadId, UserId, UserRef};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn me() -> UserRef {
    UserRef::new("u1", "ana")
}

pub fn post(id: &str, author: &str, secs: i64) -> FeedRecord {
    FeedRecord {
        post_id: PostId::from(id),
        author_id: UserId::from(author),
        author_username: format!("user {}", author),
        author_profile_pic: None,
        content: format!("post {}", id),
        media_url: None,
        like_count: 0,
        like_flag: 0,
        comment_count: 0,
        created_at: at(secs),
    }
}

pub fn summary(thread: Option<&str>, user: &str, pending: bool) -> ThreadSummary {
    ThreadSummary {
        thread_id: thread.map(ThreadId::from),
        other_user_id: UserId::from(user),
        other_display_name: format!("user {}", user),
        other_avatar: None,
        has_pending: pending,
    }
}

pub fn entry(id: Option<&str>, sender: &str, body: &str, secs: i64) -> HistoryEntry {
    HistoryEntry {
        id: id.map(MessageId::from),
        sender_id: UserId::from(sender),
        body: body.to_string(),
        timestamp: at(secs),
    }
}

pub fn inbound(id: Option<&str>, thread: &str, sender: &str, body: &str, secs: i64) -> InboundRecord {
    InboundRecord {
        id: id.map(MessageId::from),
        thread_id: ThreadId::from(thread),
        sender_id: UserId::from(sender),
        body: body.to_string(),
        timestamp: at(secs),
    }
}

/// Poll `check` until it holds, sleeping between attempts. Panics after ~60 s
/// of (possibly paused) time.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..6000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetFeed { page: u32, size: u32, author: Option<UserId> },
    ThreadList,
    History(ThreadId),
    NewMessages,
    CreateThread { to: UserId, body: String },
    Append { thread: ThreadId, body: String },
    ToggleLike(PostId),
    ListLikes(PostId),
    ListComments(PostId),
    PostComment(PostId, String),
    EditComment(CommentId, String),
    DeleteComment(CommentId),
}

/// Scriptable backend. Operations are named by the keys used in `fail_next`,
/// `delay` and `hold`: "feed", "thread_list", "history", "new_messages",
/// "create_thread", "append", "toggle_like", "likes", "comments",
/// "post_comment", "edit_comment", "delete_comment".
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    pub posts: Mutex<Vec<FeedRecord>>,
    pub thread_list: Mutex<Vec<ThreadSummary>>,
    pub histories: Mutex<HashMap<ThreadId, Vec<HistoryEntry>>>,
    pub new_messages: Mutex<VecDeque<Vec<InboundRecord>>>,
    pub likes: Mutex<HashMap<PostId, Vec<LikeRecord>>>,
    pub comments: Mutex<HashMap<PostId, Vec<CommentRecord>>>,
    failures: Mutex<HashMap<&'static str, BackendError>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    holds: Mutex<HashMap<&'static str, Arc<Notify>>>,
    created: AtomicUsize,
    comment_seq: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn set_posts(&self, posts: Vec<FeedRecord>) {
        *self.posts.lock().unwrap() = posts;
    }

    pub fn remove_post(&self, id: &str) {
        self.posts.lock().unwrap().retain(|p| p.post_id.as_str() != id);
    }

    pub fn set_thread_list(&self, list: Vec<ThreadSummary>) {
        *self.thread_list.lock().unwrap() = list;
    }

    pub fn set_history(&self, thread: &str, entries: Vec<HistoryEntry>) {
        self.histories
            .lock()
            .unwrap()
            .insert(ThreadId::from(thread), entries);
    }

    pub fn queue_new_messages(&self, batch: Vec<InboundRecord>) {
        self.new_messages.lock().unwrap().push_back(batch);
    }

    pub fn set_likes(&self, post: &str, users: &[&str]) {
        let records = users
            .iter()
            .map(|u| LikeRecord {
                like_author_id: UserId::from(*u),
                like_author_username: String::new(),
            })
            .collect();
        self.likes.lock().unwrap().insert(PostId::from(post), records);
    }

    /// The next call of `op` fails with `err`.
    pub fn fail_next(&self, op: &'static str, err: BackendError) {
        self.failures.lock().unwrap().insert(op, err);
    }

    pub fn delay(&self, op: &'static str, by: Duration) {
        self.delays.lock().unwrap().insert(op, by);
    }

    /// Calls of `op` block until the returned `Notify` is signalled once per call.
    pub fn hold(&self, op: &'static str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds.lock().unwrap().insert(op, notify.clone());
        notify
    }

    pub fn release(&self, op: &'static str) {
        self.holds.lock().unwrap().remove(op);
    }

    async fn enter(&self, op: &'static str, call: Call) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(call);
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let hold = self.holds.lock().unwrap().get(op).cloned();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        match self.failures.lock().unwrap().remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require_post(&self, post: &PostId) -> Result<(), BackendError> {
        if self.posts.lock().unwrap().iter().any(|p| p.post_id == *post) {
            Ok(())
        } else {
            Err(BackendError::NotFound {
                resource: Resource::Post,
                id: post.to_string(),
            })
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn get_feed(&self, request: &FeedRequest) -> Result<Vec<FeedRecord>, BackendError> {
        self.enter(
            "feed",
            Call::GetFeed {
                page: request.page,
                size: request.size,
                author: request.author.clone(),
            },
        )
        .await?;
        let posts = self.posts.lock().unwrap();
        let matching: Vec<&FeedRecord> = posts
            .iter()
            .filter(|p| request.author.as_ref().is_none_or(|a| p.author_id == *a))
            .collect();
        let start = ((request.page.max(1) - 1) * request.size) as usize;
        Ok(matching
            .into_iter()
            .skip(start)
            .take(request.size as usize)
            .cloned()
            .collect())
    }

    async fn get_thread_list(&self, _user: &UserId) -> Result<Vec<ThreadSummary>, BackendError> {
        self.enter("thread_list", Call::ThreadList).await?;
        Ok(self.thread_list.lock().unwrap().clone())
    }

    async fn get_thread_history(
        &self,
        thread: &ThreadId,
    ) -> Result<Vec<HistoryEntry>, BackendError> {
        self.enter("history", Call::History(thread.clone())).await?;
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(thread)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_new_messages(&self, _user: &UserId) -> Result<Vec<InboundRecord>, BackendError> {
        self.enter("new_messages", Call::NewMessages).await?;
        Ok(self.new_messages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn create_thread(
        &self,
        _from: &UserId,
        to: &UserId,
        body: &str,
    ) -> Result<ThreadAck, BackendError> {
        self.enter(
            "create_thread",
            Call::CreateThread {
                to: to.clone(),
                body: body.to_string(),
            },
        )
        .await?;
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let id = ThreadId::new(format!("t-new-{}", n + 1));
        let mut list = self.thread_list.lock().unwrap();
        match list.iter_mut().find(|s| s.other_user_id == *to) {
            Some(summary) => summary.thread_id = Some(id.clone()),
            None => list.insert(0, summary(Some(id.as_str()), to.as_str(), false)),
        }
        Ok(ThreadAck { thread_id: id })
    }

    async fn append_message(
        &self,
        thread: &ThreadId,
        _from: &UserId,
        _to: &UserId,
        body: &str,
    ) -> Result<ThreadAck, BackendError> {
        self.enter(
            "append",
            Call::Append {
                thread: thread.clone(),
                body: body.to_string(),
            },
        )
        .await?;
        Ok(ThreadAck {
            thread_id: thread.clone(),
        })
    }

    async fn toggle_like(&self, post: &PostId, viewer: &UserRef) -> Result<(), BackendError> {
        self.enter("toggle_like", Call::ToggleLike(post.clone())).await?;
        self.require_post(post)?;
        let mut likes = self.likes.lock().unwrap();
        let list = likes.entry(post.clone()).or_default();
        match list.iter().position(|l| l.like_author_id == viewer.id) {
            Some(pos) => {
                list.remove(pos);
            }
            None => list.push(LikeRecord {
                like_author_id: viewer.id.clone(),
                like_author_username: viewer.display_name.clone(),
            }),
        }
        Ok(())
    }

    async fn list_likes(&self, post: &PostId) -> Result<Vec<LikeRecord>, BackendError> {
        self.enter("likes", Call::ListLikes(post.clone())).await?;
        self.require_post(post)?;
        Ok(self.likes.lock().unwrap().get(post).cloned().unwrap_or_default())
    }

    async fn list_comments(&self, post: &PostId) -> Result<Vec<CommentRecord>, BackendError> {
        self.enter("comments", Call::ListComments(post.clone())).await?;
        self.require_post(post)?;
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(post)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_comment(
        &self,
        post: &PostId,
        author: &UserRef,
        body: &str,
    ) -> Result<(), BackendError> {
        self.enter("post_comment", Call::PostComment(post.clone(), body.to_string()))
            .await?;
        self.require_post(post)?;
        let n = self.comment_seq.fetch_add(1, Ordering::SeqCst);
        self.comments
            .lock()
            .unwrap()
            .entry(post.clone())
            .or_default()
            .push(CommentRecord {
                comment_id: CommentId::new(format!("c{}", n + 1)),
                post_id: post.clone(),
                comment_author_id: author.id.clone(),
                comment_author_username: author.display_name.clone(),
                user_profile_url: None,
                comment_content: body.to_string(),
                created_at: at(n as i64),
            });
        Ok(())
    }

    async fn edit_comment(&self, comment: &CommentId, body: &str) -> Result<(), BackendError> {
        self.enter("edit_comment", Call::EditComment(comment.clone(), body.to_string()))
            .await?;
        let mut comments = self.comments.lock().unwrap();
        let found = comments
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|c| c.comment_id == *comment);
        match found {
            Some(record) => {
                record.comment_content = body.to_string();
                Ok(())
            }
            None => Err(BackendError::NotFound {
                resource: Resource::Comment,
                id: comment.to_string(),
            }),
        }
    }

    async fn delete_comment(&self, comment: &CommentId) -> Result<(), BackendError> {
        self.enter("delete_comment", Call::DeleteComment(comment.clone()))
            .await?;
        let mut comments = self.comments.lock().unwrap();
        let mut removed = false;
        for list in comments.values_mut() {
            let before = list.len();
            list.retain(|c| c.comment_id != *comment);
            removed |= list.len() != before;
        }
        if removed {
            Ok(())
        } else {
            Err(BackendError::NotFound {
                resource: Resource::Comment,
                id: comment.to_string(),
            })
        }
    }
}

/// Server half of one fake push connection.
pub struct ServerSide {
    pub events: mpsc::Sender<PushEvent>,
    pub commands: mpsc::Receiver<PushCommand>,
}

pub struct FakeTransport {
    pub connects: AtomicUsize,
    refuse_first: usize,
    accepted_tx: mpsc::UnboundedSender<ServerSide>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSide>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::refusing(0)
    }

    /// The first `n` connection attempts fail.
    pub fn refusing(n: usize) -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            refuse_first: n,
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        })
    }

    /// Wait for the engine's next successful connection.
    pub async fn accept(&self) -> ServerSide {
        self.accepted_rx
            .lock()
            .await
            .recv()
            .await
            .expect("transport dropped")
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self) -> Result<PushLink, BackendError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refuse_first {
            return Err(BackendError::Transient("connection refused".to_string()));
        }
        let (events_tx, events_rx) = mpsc::channel(32);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let _ = self.accepted_tx.send(ServerSide {
            events: events_tx,
            commands: commands_rx,
        });
        Ok(PushLink {
            events: events_rx,
            commands: commands_tx,
        })
    }
}
