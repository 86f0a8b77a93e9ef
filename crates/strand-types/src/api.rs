//! Record shapes exchanged with the backend. Field names follow the backend's
//! camelCase JSON; Rust names follow the engine's vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Comment, CommentId, CommentSummary, ContentRef, FeedItem, LikeState, MessageId, PostId,
    ThreadId, UserId, UserRef,
};

// -- Feed --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub post_id: PostId,
    pub author_id: UserId,
    pub author_username: String,
    #[serde(default)]
    pub author_profile_pic: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub like_count: u32,
    /// 1 when the requesting viewer has liked the post.
    #[serde(default)]
    pub like_flag: u8,
    #[serde(default)]
    pub comment_count: u32,
    pub created_at: DateTime<Utc>,
}

impl FeedRecord {
    pub fn into_item(self, order: u64) -> FeedItem {
        FeedItem {
            post_id: self.post_id,
            author: UserRef {
                id: self.author_id,
                display_name: self.author_username,
                avatar: self.author_profile_pic,
            },
            content: ContentRef {
                text: self.content,
                media_url: self.media_url,
            },
            likes: LikeState {
                count: self.like_count,
                liked_by_viewer: self.like_flag != 0,
            },
            comments: CommentSummary {
                count: self.comment_count,
                list: None,
            },
            created_at: self.created_at,
            order,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedPageResponse {
    #[serde(rename = "blogPostsMostRecent", default)]
    pub posts: Vec<FeedRecord>,
}

/// Paging parameters for a feed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub page: u32,
    pub size: u32,
    pub viewer: Option<UserId>,
    pub author: Option<UserId>,
}

// -- Threads --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    #[serde(rename = "chatId", default)]
    pub thread_id: Option<ThreadId>,
    #[serde(rename = "userId")]
    pub other_user_id: UserId,
    #[serde(rename = "username")]
    pub other_display_name: String,
    #[serde(rename = "profilePicUrl", default)]
    pub other_avatar: Option<String>,
    #[serde(rename = "newMessage", default)]
    pub has_pending: bool,
}

impl ThreadSummary {
    pub fn peer(&self) -> UserRef {
        UserRef {
            id: self.other_user_id.clone(),
            display_name: self.other_display_name.clone(),
            avatar: self.other_avatar.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "messageId", default)]
    pub id: Option<MessageId>,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    #[serde(rename = "content")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// A message returned by the fast "new messages" poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRecord {
    #[serde(rename = "messageId", default)]
    pub id: Option<MessageId>,
    #[serde(rename = "chatId")]
    pub thread_id: ThreadId,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    #[serde(rename = "content")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadRequest<'a> {
    pub sender_id: &'a UserId,
    pub recipient_id: &'a UserId,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendMessageRequest<'a> {
    pub chat_id: &'a ThreadId,
    pub sender_id: &'a UserId,
    pub recipient_id: &'a UserId,
    pub content: &'a str,
}

/// Thread id echoed by create/append for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadAck {
    #[serde(rename = "chatId")]
    pub thread_id: ThreadId,
}

// -- Likes --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRequest<'a> {
    pub post_id: &'a PostId,
    pub like_author_id: &'a UserId,
    pub like_author_username: &'a str,
    pub user_profile_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRecord {
    pub like_author_id: UserId,
    #[serde(default)]
    pub like_author_username: String,
}

// -- Comments --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub comment_id: CommentId,
    pub post_id: PostId,
    pub comment_author_id: UserId,
    #[serde(default)]
    pub comment_author_username: String,
    #[serde(default)]
    pub user_profile_url: Option<String>,
    pub comment_content: String,
    pub created_at: DateTime<Utc>,
}

impl From<CommentRecord> for Comment {
    fn from(record: CommentRecord) -> Self {
        Comment {
            id: record.comment_id,
            post_id: record.post_id,
            author: UserRef {
                id: record.comment_author_id,
                display_name: record.comment_author_username,
                avatar: record.user_profile_url,
            },
            body: record.comment_content,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCommentRequest<'a> {
    pub post_id: &'a PostId,
    pub comment_author_id: &'a UserId,
    pub comment_author_username: &'a str,
    pub user_profile_url: Option<&'a str>,
    pub comment_content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditCommentRequest<'a> {
    pub comment_content: &'a str,
}
