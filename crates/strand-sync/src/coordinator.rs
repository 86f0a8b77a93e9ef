//! The engine's single read surface and action entry point.
//!
//! Push and poll producers feed one queue; a single actor task drains it into
//! the stores. User actions call the stores directly. Every store serializes
//! its own mutations, so both paths may run concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use strand_types::api::{HistoryEntry, InboundRecord, ThreadSummary};
use strand_types::events::{PushCommand, PushEvent};
use strand_types::models::{
    ChatThread, CommentId, FeedItem, FeedQuery, LikeState, PostId, ThreadId, UserId, UserRef,
};

use crate::backend::{Backend, PushTransport};
use crate::config::SyncConfig;
use crate::dedup::Deduplicator;
use crate::error::{BackendError, Resource, SyncError, SyncResult};
use crate::feed::{FeedStore, PageOutcome};
use crate::poll::PollSource;
use crate::push::{PushChannel, PushSignal};
use crate::scroll::{ScrollPolicy, Viewport};
use crate::session::SessionContext;
use crate::status::{Source, StatusBoard, SyncStatus, SyncUpdate};
use crate::tasks::Tasks;
use crate::threads::{InboundMessage, InboundOutcome, SendReceipt, ThreadStore};

/// Work item for the consumer actor.
#[derive(Debug)]
enum Inbound {
    Push(PushSignal),
    NewMessages(Vec<InboundRecord>),
    ThreadList(Vec<ThreadSummary>),
    Reconcile {
        thread_id: ThreadId,
        entries: Vec<HistoryEntry>,
    },
}

impl From<PushSignal> for Inbound {
    fn from(signal: PushSignal) -> Self {
        Inbound::Push(signal)
    }
}

pub struct SyncCoordinator {
    me: UserRef,
    config: SyncConfig,
    session: Mutex<SessionContext>,
    backend: Arc<dyn Backend>,
    board: Arc<StatusBoard>,
    threads: Arc<ThreadStore>,
    feed: Arc<FeedStore>,
    author_feeds: Mutex<HashMap<UserId, Arc<FeedStore>>>,
    push: PushChannel,
    scroll: ScrollPolicy,
    tasks: Tasks,
    queue: mpsc::Sender<Inbound>,
    stopped: AtomicBool,
}

impl SyncCoordinator {
    /// Start the engine for `session`. Must be called inside a tokio runtime.
    pub async fn start(
        session: SessionContext,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn PushTransport>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let me = session.user.clone();
        let board = Arc::new(StatusBoard::new(config.update_capacity));
        let dedup = Arc::new(Deduplicator::from_config(&config));
        let tasks = Tasks::new();
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));

        let threads = Arc::new(ThreadStore::new(
            me.clone(),
            backend.clone(),
            dedup,
            board.clone(),
        ));
        if let Some(peer) = session.last_active_peer.clone() {
            threads.prefer(peer).await;
        }
        let feed = FeedStore::new(
            FeedQuery::global(),
            me.clone(),
            backend.clone(),
            board.clone(),
            tasks.clone(),
            &config,
        );

        let coordinator = Arc::new(Self {
            me: me.clone(),
            scroll: ScrollPolicy::new(config.scroll_threshold),
            session: Mutex::new(session),
            backend,
            push: PushChannel::new(board.clone()),
            board,
            threads,
            feed,
            author_feeds: Mutex::new(HashMap::new()),
            tasks,
            queue,
            stopped: AtomicBool::new(false),
            config,
        });

        let actor = coordinator.clone();
        coordinator.tasks.spawn(async move { actor.run(rx).await });

        coordinator.push.spawn(
            &coordinator.tasks,
            transport,
            me.id.clone(),
            &coordinator.config,
            coordinator.queue.clone(),
        );
        coordinator.spawn_polls();

        let feed = coordinator.feed.clone();
        coordinator.tasks.spawn(async move {
            feed.load_next_page().await;
        });

        info!("Sync engine started for {}", me.id);
        coordinator
    }

    fn spawn_polls(self: &Arc<Self>) {
        let this = self.clone();
        PollSource::new(Source::NewMessages, self.config.message_poll_interval).spawn(
            &self.tasks,
            move || {
                let this = this.clone();
                async move { this.poll_new_messages().await }
            },
        );

        let this = self.clone();
        PollSource::new(Source::ThreadList, self.config.thread_poll_interval).spawn(
            &self.tasks,
            move || {
                let this = this.clone();
                async move { this.poll_thread_list().await }
            },
        );

        let this = self.clone();
        PollSource::new(Source::Reconcile, self.config.reconcile_interval).spawn(
            &self.tasks,
            move || {
                let this = this.clone();
                async move { this.poll_reconcile().await }
            },
        );
    }

    // -- Producers --

    async fn poll_new_messages(&self) {
        match self.backend.get_new_messages(&self.me.id).await {
            Ok(records) => {
                self.board.recover(Source::NewMessages);
                if !records.is_empty() {
                    let _ = self.queue.send(Inbound::NewMessages(records)).await;
                }
            }
            Err(err) => self.board.stall(Source::NewMessages, &err),
        }
    }

    async fn poll_thread_list(&self) {
        match self.backend.get_thread_list(&self.me.id).await {
            Ok(list) => {
                self.board.recover(Source::ThreadList);
                let _ = self.queue.send(Inbound::ThreadList(list)).await;
            }
            Err(err) => self.board.stall(Source::ThreadList, &err),
        }
    }

    async fn poll_reconcile(&self) {
        let Some(thread_id) = self.threads.active_thread_id().await else {
            return;
        };
        match self.backend.get_thread_history(&thread_id).await {
            Ok(entries) => {
                self.board.recover(Source::Reconcile);
                let _ = self
                    .queue
                    .send(Inbound::Reconcile { thread_id, entries })
                    .await;
            }
            Err(BackendError::NotFound {
                resource: Resource::Thread,
                ..
            }) => {
                warn!("Active thread {} vanished, refreshing thread list", thread_id);
                self.poll_thread_list().await;
            }
            Err(err) => self.board.stall(Source::Reconcile, &err),
        }
    }

    // -- Consumer --

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(inbound) = rx.recv().await {
            if self.is_stopped() {
                break;
            }
            self.handle(inbound).await;
        }
        debug!("sync actor finished");
    }

    async fn handle(&self, inbound: Inbound) {
        match inbound {
            Inbound::Push(PushSignal::Connected) => {
                // events may have been missed while disconnected
                self.spawn_thread_list_refresh();
            }
            Inbound::Push(PushSignal::Disconnected) => {
                debug!("push down, continuing on polls");
            }
            Inbound::Push(PushSignal::Event(event)) => self.apply_event(event).await,
            Inbound::NewMessages(records) => {
                for record in records {
                    self.apply_message(record.into()).await;
                }
            }
            Inbound::ThreadList(list) => {
                if let Some(thread_id) = self.threads.apply_thread_list(list).await {
                    self.spawn_history(thread_id);
                }
            }
            Inbound::Reconcile { thread_id, entries } => {
                self.threads.reconcile(&thread_id, entries).await;
            }
        }
    }

    async fn apply_event(&self, event: PushEvent) {
        match event {
            PushEvent::MessageCreate {
                id,
                thread_id,
                sender_id,
                body,
                timestamp,
            } => {
                self.apply_message(InboundMessage {
                    server_id: id,
                    thread_id,
                    sender_id,
                    body,
                    timestamp,
                })
                .await;
            }
            PushEvent::ThreadListUpdate { user_id } => {
                if user_id == self.me.id {
                    self.spawn_thread_list_refresh();
                }
            }
            PushEvent::BellCount { count } => {
                let total = {
                    let mut session = self.session();
                    session.bell_count = session.bell_count.saturating_add(count);
                    session.bell_count
                };
                debug!(count, total, "bell count updated");
                self.board.publish(SyncUpdate::BellCount { total });
            }
        }
    }

    async fn apply_message(&self, msg: InboundMessage) {
        if self.threads.apply_inbound(msg).await == InboundOutcome::UnknownThread {
            self.spawn_thread_list_refresh();
        }
    }

    fn spawn_thread_list_refresh(&self) {
        let backend = self.backend.clone();
        let board = self.board.clone();
        let queue = self.queue.clone();
        let me = self.me.id.clone();
        self.tasks.spawn(async move {
            match backend.get_thread_list(&me).await {
                Ok(list) => {
                    board.recover(Source::ThreadList);
                    let _ = queue.send(Inbound::ThreadList(list)).await;
                }
                Err(err) => board.stall(Source::ThreadList, &err),
            }
        });
    }

    fn spawn_history(&self, thread_id: ThreadId) {
        let threads = self.threads.clone();
        self.tasks.spawn(async move {
            threads.load_history(&thread_id).await;
        });
    }

    // -- Lifecycle --

    fn session(&self) -> std::sync::MutexGuard<'_, SessionContext> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.is_stopped() {
            return Err(SyncError::Stopped);
        }
        Ok(())
    }

    /// Halt every timer, the push connection and in-flight fetches. No store
    /// mutation happens after this returns.
    pub async fn stop(&self) -> SessionContext {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return self.session().clone();
        }
        self.threads.close().await;
        self.feed.close().await;
        let author_feeds: Vec<Arc<FeedStore>> = self
            .author_feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for feed in author_feeds {
            feed.close().await;
        }
        self.tasks.shutdown().await;

        if let Some(peer) = self.threads.active_peer().await {
            self.session().last_active_peer = Some(peer);
        }
        info!("Sync engine stopped for {}", self.me.id);
        self.session().clone()
    }

    // -- Reads --

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.board.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.board.snapshot()
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    pub fn bell_count(&self) -> i64 {
        self.session().bell_count
    }

    pub async fn threads(&self) -> Vec<ChatThread> {
        self.threads.threads().await
    }

    pub async fn active_thread(&self) -> Option<ChatThread> {
        self.threads.active_thread().await
    }

    pub async fn feed(&self) -> Vec<FeedItem> {
        self.feed.items().await
    }

    pub async fn feed_items(&self, query: &FeedQuery) -> SyncResult<Vec<FeedItem>> {
        Ok(self.feed_of(query)?.items().await)
    }

    pub fn should_autoscroll(&self, viewport: &Viewport, force: bool) -> bool {
        self.scroll.should_autoscroll(viewport, force)
    }

    pub fn thread_store(&self) -> &Arc<ThreadStore> {
        &self.threads
    }

    pub fn feed_store(&self) -> &Arc<FeedStore> {
        &self.feed
    }

    // -- Chat actions --

    pub async fn send(&self, to: &UserRef, body: &str) -> SyncResult<SendReceipt> {
        self.ensure_running()?;
        let receipt = self.threads.send(to, body).await?;
        if receipt.created && !self.is_stopped() {
            self.session().last_active_peer = Some(to.id.clone());
            // list the new thread once, with its server-side position
            self.spawn_thread_list_refresh();
        }
        Ok(receipt)
    }

    pub async fn select_thread(&self, peer: &UserId) -> SyncResult<()> {
        self.ensure_running()?;
        if let Some(thread_id) = self.threads.select_thread(peer).await? {
            self.spawn_history(thread_id);
        }
        self.session().last_active_peer = Some(peer.clone());
        Ok(())
    }

    /// Start or resume a conversation with `user`, e.g. from a profile page.
    pub async fn open_thread(&self, user: &UserRef) -> SyncResult<()> {
        self.ensure_running()?;
        if let Some(thread_id) = self.threads.open_thread(user).await? {
            self.spawn_history(thread_id);
        }
        self.session().last_active_peer = Some(user.id.clone());
        Ok(())
    }

    pub async fn refresh_threads(&self) -> SyncResult<()> {
        self.ensure_running()?;
        let list = self.backend.get_thread_list(&self.me.id).await?;
        self.queue
            .send(Inbound::ThreadList(list))
            .await
            .map_err(|_| SyncError::Stopped)
    }

    // -- Feed actions --

    fn feed_of(&self, query: &FeedQuery) -> SyncResult<Arc<FeedStore>> {
        match &query.author {
            None => Ok(self.feed.clone()),
            Some(author) => self.author_feed(author),
        }
    }

    /// The feed of one author's posts, created and loaded on first use.
    pub fn author_feed(&self, author: &UserId) -> SyncResult<Arc<FeedStore>> {
        self.ensure_running()?;
        let mut feeds = self
            .author_feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(feed) = feeds.get(author) {
            return Ok(feed.clone());
        }
        let feed = FeedStore::new(
            FeedQuery::by_author(author.clone()),
            self.me.clone(),
            self.backend.clone(),
            self.board.clone(),
            self.tasks.clone(),
            &self.config,
        );
        feeds.insert(author.clone(), feed.clone());
        drop(feeds);

        let first = feed.clone();
        self.tasks.spawn(async move {
            first.load_next_page().await;
        });
        Ok(feed)
    }

    pub async fn load_more(&self, query: &FeedQuery) -> SyncResult<PageOutcome> {
        self.ensure_running()?;
        Ok(self.feed_of(query)?.load_next_page().await)
    }

    /// Load the next page when the feed pane is scrolled near its end.
    pub async fn on_feed_scroll(
        &self,
        query: &FeedQuery,
        viewport: &Viewport,
    ) -> SyncResult<Option<PageOutcome>> {
        if !self.scroll.should_load_more(viewport) {
            return Ok(None);
        }
        self.load_more(query).await.map(Some)
    }

    pub async fn refresh_feed(&self, query: &FeedQuery) -> SyncResult<usize> {
        self.ensure_running()?;
        self.feed_of(query)?.refresh().await
    }

    /// Toggle the viewer's like. A new like bumps the author's bell.
    pub async fn toggle_like(&self, query: &FeedQuery, post: &PostId) -> SyncResult<LikeState> {
        self.ensure_running()?;
        let outcome = self.feed_of(query)?.toggle_like(post).await?;
        if outcome.likes.liked_by_viewer && outcome.author.id != self.me.id {
            let bell = PushCommand::SendBell {
                target_user_id: outcome.author.id.clone(),
                count: 1,
            };
            if let Err(err) = self.push.send(bell) {
                debug!(error = %err, "bell not delivered");
            }
        }
        Ok(outcome.likes)
    }

    pub async fn toggle_comments(&self, query: &FeedQuery, post: &PostId) -> SyncResult<bool> {
        self.ensure_running()?;
        self.feed_of(query)?.toggle_comments(post).await
    }

    pub async fn add_comment(
        &self,
        query: &FeedQuery,
        post: &PostId,
        body: &str,
    ) -> SyncResult<usize> {
        self.ensure_running()?;
        self.feed_of(query)?.add_comment(post, body).await
    }

    pub async fn edit_comment(
        &self,
        query: &FeedQuery,
        post: &PostId,
        comment: &CommentId,
        body: &str,
    ) -> SyncResult<usize> {
        self.ensure_running()?;
        self.feed_of(query)?.edit_comment(post, comment, body).await
    }

    pub async fn delete_comment(
        &self,
        query: &FeedQuery,
        post: &PostId,
        comment: &CommentId,
    ) -> SyncResult<usize> {
        self.ensure_running()?;
        self.feed_of(query)?.delete_comment(post, comment).await
    }
}
