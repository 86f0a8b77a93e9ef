use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use strand_sync::backend::Backend;
use strand_sync::error::{BackendError, Resource};
use strand_types::api::{
    AppendMessageRequest, CommentRecord, CreateThreadRequest, EditCommentRequest, FeedPageResponse,
    FeedRecord, FeedRequest, HistoryEntry, InboundRecord, LikeRecord, LikeRequest,
    PostCommentRequest, ThreadAck, ThreadSummary,
};
use strand_types::models::{CommentId, PostId, ThreadId, UserId, UserRef};

use crate::error::{ApiError, Target};
use crate::routes;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `Backend` over the REST API at `base_url`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send and fail on any non-success status, keeping the body as message.
    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            debug!(status = code, "backend rejected request");
            return Err(ApiError::Server {
                status: code,
                message: body,
            });
        }
        Ok(resp)
    }

    async fn parse<R: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<R, ApiError> {
        let resp = Self::send(builder).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let raw = String::from_utf8_lossy(&bytes);
            let end = raw.char_indices().nth(200).map_or(raw.len(), |(i, _)| i);
            warn!("undecodable response body: {} ({})", e, &raw[..end]);
            ApiError::Decode(format!("response body: {}", e))
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get_feed(&self, request: &FeedRequest) -> Result<Vec<FeedRecord>, BackendError> {
        let mut query = vec![
            ("pageNumber", request.page.to_string()),
            ("pageSize", request.size.to_string()),
        ];
        if let Some(viewer) = &request.viewer {
            query.push(("userId", viewer.to_string()));
        }
        if let Some(author) = &request.author {
            query.push(("authorId", author.to_string()));
        }
        let req = self.http.get(self.url(routes::FEED)).query(&query);
        let page: FeedPageResponse = Self::parse(req).await.map_err(|e| e.into_backend(None))?;
        Ok(page.posts)
    }

    async fn get_thread_list(&self, user: &UserId) -> Result<Vec<ThreadSummary>, BackendError> {
        let req = self.http.get(self.url(&routes::thread_list(user)));
        Self::parse(req).await.map_err(|e| e.into_backend(None))
    }

    async fn get_thread_history(
        &self,
        thread: &ThreadId,
    ) -> Result<Vec<HistoryEntry>, BackendError> {
        let req = self.http.get(self.url(&routes::thread_history(thread)));
        Self::parse(req)
            .await
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Thread, thread.as_str()))))
    }

    async fn get_new_messages(&self, user: &UserId) -> Result<Vec<InboundRecord>, BackendError> {
        let req = self.http.get(self.url(&routes::new_messages(user)));
        Self::parse(req).await.map_err(|e| e.into_backend(None))
    }

    async fn create_thread(
        &self,
        from: &UserId,
        to: &UserId,
        body: &str,
    ) -> Result<ThreadAck, BackendError> {
        let req = self.http.post(self.url(routes::NEW_THREAD)).json(&CreateThreadRequest {
            sender_id: from,
            recipient_id: to,
            content: body,
        });
        Self::parse(req).await.map_err(|e| e.into_backend(None))
    }

    async fn append_message(
        &self,
        thread: &ThreadId,
        from: &UserId,
        to: &UserId,
        body: &str,
    ) -> Result<ThreadAck, BackendError> {
        let req = self.http.post(self.url(routes::SEND_MESSAGE)).json(&AppendMessageRequest {
            chat_id: thread,
            sender_id: from,
            recipient_id: to,
            content: body,
        });
        Self::parse(req)
            .await
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Thread, thread.as_str()))))
    }

    async fn toggle_like(&self, post: &PostId, viewer: &UserRef) -> Result<(), BackendError> {
        let req = self.http.post(self.url(routes::LIKE_TOGGLE)).json(&LikeRequest {
            post_id: post,
            like_author_id: &viewer.id,
            like_author_username: &viewer.display_name,
            user_profile_url: viewer.avatar.as_deref(),
        });
        Self::send(req)
            .await
            .map(drop)
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Post, post.as_str()))))
    }

    async fn list_likes(&self, post: &PostId) -> Result<Vec<LikeRecord>, BackendError> {
        let req = self
            .http
            .get(self.url(routes::LIKES))
            .query(&[("postId", post.as_str())]);
        Self::parse(req)
            .await
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Post, post.as_str()))))
    }

    async fn list_comments(&self, post: &PostId) -> Result<Vec<CommentRecord>, BackendError> {
        let req = self
            .http
            .get(self.url(routes::COMMENTS))
            .query(&[("postId", post.as_str())]);
        Self::parse(req)
            .await
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Post, post.as_str()))))
    }

    async fn post_comment(
        &self,
        post: &PostId,
        author: &UserRef,
        body: &str,
    ) -> Result<(), BackendError> {
        let req = self.http.post(self.url(routes::NEW_COMMENT)).json(&PostCommentRequest {
            post_id: post,
            comment_author_id: &author.id,
            comment_author_username: &author.display_name,
            user_profile_url: author.avatar.as_deref(),
            comment_content: body,
        });
        Self::send(req)
            .await
            .map(drop)
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Post, post.as_str()))))
    }

    async fn edit_comment(&self, comment: &CommentId, body: &str) -> Result<(), BackendError> {
        let req = self
            .http
            .put(self.url(&routes::edit_comment(comment)))
            .json(&EditCommentRequest {
                comment_content: body,
            });
        Self::send(req)
            .await
            .map(drop)
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Comment, comment.as_str()))))
    }

    async fn delete_comment(&self, comment: &CommentId) -> Result<(), BackendError> {
        let req = self.http.delete(self.url(&routes::delete_comment(comment)));
        Self::send(req)
            .await
            .map(drop)
            .map_err(|e| e.into_backend(Some(Target::new(Resource::Comment, comment.as_str()))))
    }
}
