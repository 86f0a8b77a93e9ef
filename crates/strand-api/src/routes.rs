//! Backend endpoint paths, relative to the API base URL.

use strand_types::models::{CommentId, ThreadId, UserId};

pub const FEED: &str = "/Feeds/getUserFeeds";

pub const NEW_THREAD: &str = "/Messages/new-chat";
pub const SEND_MESSAGE: &str = "/Messages/send-message";

pub const LIKE_TOGGLE: &str = "/UserPost/like-unlike-post";
pub const LIKES: &str = "/UserPost/post-likes";
pub const COMMENTS: &str = "/UserPost/post-comments";
pub const NEW_COMMENT: &str = "/UserPost/create-post-comment";

pub fn thread_list(user: &UserId) -> String {
    format!("/Messages/chat-users/{}", user)
}

pub fn thread_history(thread: &ThreadId) -> String {
    format!("/Messages/chat-history/{}", thread)
}

/// Messages delivered since this user's previous poll.
pub fn new_messages(user: &UserId) -> String {
    format!("/Messages/new-messages/{}", user)
}

pub fn edit_comment(comment: &CommentId) -> String {
    format!("/UserPost/edit-post-comment/{}", comment)
}

pub fn delete_comment(comment: &CommentId) -> String {
    format!("/UserPost/delete-post-comment/{}", comment)
}
