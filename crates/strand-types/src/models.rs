use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Backend-issued user identity.
    UserId
);
string_id!(
    /// Backend-issued thread identity. Absent until the first message persists.
    ThreadId
);
string_id!(PostId);
string_id!(CommentId);
string_id!(
    /// Server-assigned message identity, when the backend provides one.
    MessageId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A chat message. Immutable once created; owned by exactly one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Client-side identity, stable for optimistic copies that have no server id yet.
    pub local_id: Uuid,
    pub server_id: Option<MessageId>,
    pub thread_id: Option<ThreadId>,
    pub sender_id: UserId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

/// One conversation between the session user and `peer`.
///
/// Threads are addressed by peer locally because `id` stays `None` until the
/// backend persists the first message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: Option<ThreadId>,
    pub me: UserId,
    pub peer: UserRef,
    pub messages: Vec<Message>,
    pub has_unseen: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl ChatThread {
    pub fn new(me: UserId, peer: UserRef, id: Option<ThreadId>) -> Self {
        Self {
            id,
            me,
            peer,
            messages: Vec::new(),
            has_unseen: false,
            last_activity_at: None,
        }
    }

    /// Insert keeping timestamp order; equal timestamps keep arrival order.
    pub fn insert_ordered(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.last_activity_at = match self.last_activity_at {
            Some(prev) if prev >= message.timestamp => Some(prev),
            _ => Some(message.timestamp),
        };
        self.messages.insert(at, message);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRef {
    pub text: String,
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub count: u32,
    pub liked_by_viewer: bool,
}

impl LikeState {
    /// Flip the viewer's like, adjusting the count without underflow.
    pub fn toggle(&mut self) {
        if self.liked_by_viewer {
            self.liked_by_viewer = false;
            self.count = self.count.saturating_sub(1);
        } else {
            self.liked_by_viewer = true;
            self.count = self.count.saturating_add(1);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub author: UserRef,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentSummary {
    pub count: u32,
    /// `None` until the list has been fetched.
    pub list: Option<Vec<Comment>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub post_id: PostId,
    pub author: UserRef,
    pub content: ContentRef,
    pub likes: LikeState,
    pub comments: CommentSummary,
    pub created_at: DateTime<Utc>,
    /// Position assigned when the item entered the feed.
    pub order: u64,
}

/// Feed query context: the global feed, or one author's posts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedQuery {
    pub author: Option<UserId>,
}

impl FeedQuery {
    pub fn global() -> Self {
        Self { author: None }
    }

    pub fn by_author(author: UserId) -> Self {
        Self {
            author: Some(author),
        }
    }
}
