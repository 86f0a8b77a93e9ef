//! Collaborator contracts consumed by the engine.

use async_trait::async_trait;
use tokio::sync::mpsc;

use strand_types::api::{
    CommentRecord, FeedRecord, FeedRequest, HistoryEntry, InboundRecord, LikeRecord, ThreadAck,
    ThreadSummary,
};
use strand_types::events::{PushCommand, PushEvent};
use strand_types::models::{CommentId, PostId, ThreadId, UserId, UserRef};

use crate::error::BackendError;

/// Request/response operations of the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One page of a feed. An empty page means the feed is exhausted.
    async fn get_feed(&self, request: &FeedRequest) -> Result<Vec<FeedRecord>, BackendError>;

    /// Threads of `user`, most recent first.
    async fn get_thread_list(&self, user: &UserId) -> Result<Vec<ThreadSummary>, BackendError>;

    async fn get_thread_history(&self, thread: &ThreadId)
    -> Result<Vec<HistoryEntry>, BackendError>;

    /// Messages for `user` since the previous call.
    async fn get_new_messages(&self, user: &UserId) -> Result<Vec<InboundRecord>, BackendError>;

    async fn create_thread(
        &self,
        from: &UserId,
        to: &UserId,
        body: &str,
    ) -> Result<ThreadAck, BackendError>;

    async fn append_message(
        &self,
        thread: &ThreadId,
        from: &UserId,
        to: &UserId,
        body: &str,
    ) -> Result<ThreadAck, BackendError>;

    async fn toggle_like(&self, post: &PostId, viewer: &UserRef) -> Result<(), BackendError>;

    async fn list_likes(&self, post: &PostId) -> Result<Vec<LikeRecord>, BackendError>;

    async fn list_comments(&self, post: &PostId) -> Result<Vec<CommentRecord>, BackendError>;

    async fn post_comment(
        &self,
        post: &PostId,
        author: &UserRef,
        body: &str,
    ) -> Result<(), BackendError>;

    async fn edit_comment(&self, comment: &CommentId, body: &str) -> Result<(), BackendError>;

    async fn delete_comment(&self, comment: &CommentId) -> Result<(), BackendError>;
}

/// An established push connection. Dropping `events` (the transport closing
/// its sender) signals that the connection is gone.
pub struct PushLink {
    pub events: mpsc::Receiver<PushEvent>,
    pub commands: mpsc::Sender<PushCommand>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<PushLink, BackendError>;
}
