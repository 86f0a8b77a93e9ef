use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use strand_types::api::{FeedRecord, FeedRequest};
use strand_types::models::{
    Comment, CommentId, CommentSummary, FeedItem, FeedQuery, LikeState, PostId, UserRef,
};

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::dedup::{DedupKey, Deduplicator, Namespace};
use crate::error::{BackendError, Resource, SyncError, SyncResult};
use crate::poll::InFlight;
use crate::status::{Source, StatusBoard, SyncUpdate};
use crate::tasks::Tasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Next page to request, 1-based.
    pub page: u32,
    pub size: u32,
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Another page load was in flight; no request issued.
    Skipped,
    Appended { added: usize },
    /// The feed has no more pages; no further requests are issued.
    Exhausted,
    /// A refresh or teardown happened while the page was loading.
    Discarded,
    Failed(SyncError),
}

/// Result of a like toggle, with the author to notify.
#[derive(Debug, Clone, PartialEq)]
pub struct LikeOutcome {
    pub likes: LikeState,
    pub author: UserRef,
}

struct FeedState {
    items: Vec<FeedItem>,
    cursor: PageCursor,
    generation: u64,
    next_order: u64,
    expanded: HashSet<PostId>,
    closed: bool,
}

impl FeedState {
    fn position(&self, post: &PostId) -> Option<usize> {
        self.items.iter().position(|item| item.post_id == *post)
    }

    fn item_mut(&mut self, post: &PostId) -> Option<&mut FeedItem> {
        self.items.iter_mut().find(|item| item.post_id == *post)
    }

    fn push_record(&mut self, record: FeedRecord) -> PostId {
        let order = self.next_order;
        self.next_order += 1;
        let item = record.into_item(order);
        let id = item.post_id.clone();
        self.items.push(item);
        id
    }
}

fn not_found_post(post: &PostId) -> SyncError {
    SyncError::NotFound {
        resource: Resource::Post,
        id: post.to_string(),
    }
}

/// Paginated, append-only feed for one query, plus per-item enrichment.
pub struct FeedStore {
    query: FeedQuery,
    viewer: UserRef,
    page_size: u32,
    backend: Arc<dyn Backend>,
    board: Arc<StatusBoard>,
    tasks: Tasks,
    /// Post ids already in this feed. Reset and re-seeded on refresh.
    seen: Deduplicator,
    loading: InFlight,
    state: RwLock<FeedState>,
}

impl FeedStore {
    pub fn new(
        query: FeedQuery,
        viewer: UserRef,
        backend: Arc<dyn Backend>,
        board: Arc<StatusBoard>,
        tasks: Tasks,
        config: &SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            query,
            viewer,
            page_size: config.page_size,
            backend,
            board,
            tasks,
            seen: Deduplicator::from_config(config),
            loading: InFlight::new(),
            state: RwLock::new(FeedState {
                items: Vec::new(),
                cursor: PageCursor {
                    page: 1,
                    size: config.page_size,
                    exhausted: false,
                },
                generation: 0,
                next_order: 0,
                expanded: HashSet::new(),
                closed: false,
            }),
        })
    }

    pub fn query(&self) -> &FeedQuery {
        &self.query
    }

    pub async fn items(&self) -> Vec<FeedItem> {
        self.state.read().await.items.clone()
    }

    pub async fn item(&self, post: &PostId) -> Option<FeedItem> {
        let state = self.state.read().await;
        state.position(post).map(|idx| state.items[idx].clone())
    }

    pub async fn cursor(&self) -> PageCursor {
        self.state.read().await.cursor
    }

    pub async fn is_expanded(&self, post: &PostId) -> bool {
        self.state.read().await.expanded.contains(post)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_busy()
    }

    fn request(&self, page: u32, size: u32) -> FeedRequest {
        FeedRequest {
            page,
            size,
            viewer: Some(self.viewer.id.clone()),
            author: self.query.author.clone(),
        }
    }

    fn changed(&self) {
        self.board.publish(SyncUpdate::FeedChanged {
            query: self.query.clone(),
        });
    }

    /// Whether a fetched post should be appended. Retention forgets keys after
    /// its window or capacity, so the displayed list is checked as well.
    fn admit_post(&self, state: &FeedState, post: &PostId) -> bool {
        let fresh = self.seen.admit(&DedupKey::from_id(Namespace::Post, post.as_str()));
        fresh && state.position(post).is_none()
    }

    // -- Paging --

    pub async fn load_next_page(self: &Arc<Self>) -> PageOutcome {
        let Some(_loading) = self.loading.try_begin() else {
            debug!(query = ?self.query, "page load already in flight");
            return PageOutcome::Skipped;
        };

        let (request, generation) = {
            let state = self.state.read().await;
            if state.closed {
                return PageOutcome::Discarded;
            }
            if state.cursor.exhausted {
                return PageOutcome::Exhausted;
            }
            (
                self.request(state.cursor.page, state.cursor.size),
                state.generation,
            )
        };

        let records = match self.backend.get_feed(&request).await {
            Ok(records) => {
                self.board.recover(Source::FeedPage);
                records
            }
            Err(err) => {
                self.board.stall(Source::FeedPage, &err);
                return PageOutcome::Failed(err.into());
            }
        };

        let mut state = self.state.write().await;
        if state.closed || state.generation != generation {
            debug!(page = request.page, "feed page superseded, discarding");
            return PageOutcome::Discarded;
        }
        if records.is_empty() {
            info!("Feed {:?} exhausted at page {}", self.query, request.page);
            state.cursor.exhausted = true;
            drop(state);
            self.changed();
            return PageOutcome::Exhausted;
        }

        state.cursor.page += 1;
        let mut added = Vec::new();
        for record in records {
            if self.admit_post(&state, &record.post_id) {
                added.push(state.push_record(record));
            }
        }
        drop(state);

        debug!(page = request.page, added = added.len(), "feed page applied");
        self.changed();
        for post in &added {
            self.enrich(post);
        }
        PageOutcome::Appended { added: added.len() }
    }

    /// Re-sync the already displayed window from page 1 and replace the items.
    pub async fn refresh(self: &Arc<Self>) -> SyncResult<usize> {
        let (request, generation) = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(SyncError::Stopped);
            }
            state.generation += 1;
            let size = u32::try_from(state.items.len())
                .unwrap_or(u32::MAX)
                .max(self.page_size);
            (self.request(1, size), state.generation)
        };

        let records = match self.backend.get_feed(&request).await {
            Ok(records) => {
                self.board.recover(Source::FeedPage);
                records
            }
            Err(err) => {
                self.board.stall(Source::FeedPage, &err);
                return Err(err.into());
            }
        };

        let mut state = self.state.write().await;
        if state.closed {
            return Err(SyncError::Stopped);
        }
        if state.generation != generation {
            debug!("refresh superseded by a newer refresh");
            return Ok(state.items.len());
        }

        let mut loaded: HashMap<PostId, Vec<Comment>> = std::mem::take(&mut state.items)
            .into_iter()
            .filter_map(|item| item.comments.list.map(|list| (item.post_id, list)))
            .collect();
        self.seen.reset();
        state.next_order = 0;
        for record in records {
            if self.admit_post(&state, &record.post_id) {
                state.push_record(record);
            }
        }
        for item in state.items.iter_mut() {
            if let Some(list) = loaded.remove(&item.post_id) {
                item.comments.list = Some(list);
            }
        }
        let count = state.items.len();
        state.cursor = PageCursor {
            page: count as u32 / self.page_size + 1,
            size: self.page_size,
            exhausted: false,
        };
        let ids: Vec<PostId> = state.items.iter().map(|item| item.post_id.clone()).collect();
        drop(state);

        info!("Feed {:?} refreshed with {} items", self.query, count);
        self.changed();
        for post in &ids {
            self.enrich(post);
        }
        Ok(count)
    }

    // -- Enrichment --

    /// Fetch comments and like state for one item as two independent tasks.
    pub fn enrich(self: &Arc<Self>, post: &PostId) {
        let store = self.clone();
        let id = post.clone();
        self.tasks.spawn(async move {
            let _ = store.load_comments(&id).await;
        });
        let store = self.clone();
        let id = post.clone();
        self.tasks.spawn(async move {
            let _ = store.load_likes(&id).await;
        });
    }

    /// Fetch the authoritative comment list; the count is derived from it.
    pub async fn load_comments(&self, post: &PostId) -> SyncResult<usize> {
        match self.backend.list_comments(post).await {
            Ok(records) => {
                self.board.recover(Source::Enrichment);
                let comments: Vec<Comment> = records.into_iter().map(Comment::from).collect();
                let count = comments.len();
                let mut state = self.state.write().await;
                if state.closed {
                    return Err(SyncError::Stopped);
                }
                let Some(item) = state.item_mut(post) else {
                    return Ok(count);
                };
                item.comments = CommentSummary {
                    count: count as u32,
                    list: Some(comments),
                };
                drop(state);
                self.board.publish(SyncUpdate::ItemEnriched {
                    post_id: post.clone(),
                });
                Ok(count)
            }
            Err(err) => Err(self.background_failure(post, err).await),
        }
    }

    pub async fn load_likes(&self, post: &PostId) -> SyncResult<LikeState> {
        match self.backend.list_likes(post).await {
            Ok(likes) => {
                self.board.recover(Source::Enrichment);
                let state_now = LikeState {
                    count: likes.len() as u32,
                    liked_by_viewer: likes.iter().any(|l| l.like_author_id == self.viewer.id),
                };
                let mut state = self.state.write().await;
                if state.closed {
                    return Err(SyncError::Stopped);
                }
                if let Some(item) = state.item_mut(post) {
                    item.likes = state_now;
                    drop(state);
                    self.board.publish(SyncUpdate::ItemEnriched {
                        post_id: post.clone(),
                    });
                }
                Ok(state_now)
            }
            Err(err) => Err(self.background_failure(post, err).await),
        }
    }

    async fn background_failure(&self, post: &PostId, err: BackendError) -> SyncError {
        match &err {
            BackendError::NotFound {
                resource: Resource::Post,
                ..
            } => self.remove_item(post).await,
            _ => self.board.stall(Source::Enrichment, &err),
        }
        err.into()
    }

    async fn remove_item(&self, post: &PostId) {
        let mut state = self.state.write().await;
        if state.closed {
            return;
        }
        let Some(idx) = state.position(post) else {
            return;
        };
        state.items.remove(idx);
        state.expanded.remove(post);
        drop(state);
        info!("Post {} no longer exists, removed from feed", post);
        self.changed();
    }

    // -- User actions --

    /// Flip the viewer's like immediately, then tell the backend. A failed
    /// call leaves the flip in place and returns the error.
    pub async fn toggle_like(&self, post: &PostId) -> SyncResult<LikeOutcome> {
        let outcome = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(SyncError::Stopped);
            }
            let item = state.item_mut(post).ok_or_else(|| not_found_post(post))?;
            item.likes.toggle();
            LikeOutcome {
                likes: item.likes,
                author: item.author.clone(),
            }
        };
        self.board.publish(SyncUpdate::ItemEnriched {
            post_id: post.clone(),
        });

        if let Err(err) = self.backend.toggle_like(post, &self.viewer).await {
            warn!(post = %post, error = %err, "like toggle failed, local state kept");
            if matches!(err, BackendError::NotFound { resource: Resource::Post, .. }) {
                self.remove_item(post).await;
            }
            return Err(err.into());
        }
        Ok(outcome)
    }

    /// Show or hide an item's comments, loading the list on first expand.
    pub async fn toggle_comments(&self, post: &PostId) -> SyncResult<bool> {
        let (expanded, needs_load) = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(SyncError::Stopped);
            }
            let loaded = state
                .item_mut(post)
                .ok_or_else(|| not_found_post(post))?
                .comments
                .list
                .is_some();
            let expanded = if state.expanded.remove(post) {
                false
            } else {
                state.expanded.insert(post.clone());
                true
            };
            (expanded, expanded && !loaded)
        };
        self.board.publish(SyncUpdate::ItemEnriched {
            post_id: post.clone(),
        });
        if needs_load {
            self.load_comments(post).await?;
        }
        Ok(expanded)
    }

    pub async fn add_comment(&self, post: &PostId, body: &str) -> SyncResult<usize> {
        if body.trim().is_empty() {
            return Err(SyncError::Validation("comment body is empty".to_string()));
        }
        self.ensure_open().await?;
        if let Err(err) = self.backend.post_comment(post, &self.viewer, body).await {
            return Err(self.comment_failure(post, err).await);
        }
        self.load_comments(post).await
    }

    pub async fn edit_comment(
        &self,
        post: &PostId,
        comment: &CommentId,
        body: &str,
    ) -> SyncResult<usize> {
        if body.trim().is_empty() {
            return Err(SyncError::Validation("comment body is empty".to_string()));
        }
        self.ensure_open().await?;
        if let Err(err) = self.backend.edit_comment(comment, body).await {
            return Err(self.comment_failure(post, err).await);
        }
        self.load_comments(post).await
    }

    pub async fn delete_comment(&self, post: &PostId, comment: &CommentId) -> SyncResult<usize> {
        self.ensure_open().await?;
        if let Err(err) = self.backend.delete_comment(comment).await {
            return Err(self.comment_failure(post, err).await);
        }
        self.load_comments(post).await
    }

    async fn comment_failure(&self, post: &PostId, err: BackendError) -> SyncError {
        warn!(post = %post, error = %err, "comment operation failed");
        match &err {
            BackendError::NotFound {
                resource: Resource::Post,
                ..
            } => self.remove_item(post).await,
            BackendError::NotFound {
                resource: Resource::Comment,
                ..
            } => {
                let _ = self.load_comments(post).await;
            }
            _ => {}
        }
        err.into()
    }

    async fn ensure_open(&self) -> SyncResult<()> {
        if self.state.read().await.closed {
            return Err(SyncError::Stopped);
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.state.write().await.closed = true;
    }
}
