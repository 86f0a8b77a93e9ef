/// Integration tests: the full engine with fake backend and push transport.
///
/// Time is paused, so poll intervals and reconnect backoff elapse instantly
/// whenever the runtime is otherwise idle.
mod common;

use std::sync::Arc;
use std::time::Duration;

use strand_sync::config::SyncConfig;
use strand_sync::coordinator::SyncCoordinator;
use strand_sync::error::SyncError;
use strand_sync::feed::PageOutcome;
use strand_sync::scroll::Viewport;
use strand_sync::session::SessionContext;
use strand_sync::status::SyncUpdate;
use strand_sync::threads::{InboundMessage, InboundOutcome};
use strand_types::events::{EventKind, PushCommand, PushEvent};
use strand_types::models::{FeedQuery, PostId, ThreadId, UserId, UserRef};

use common::{
    Call, FakeBackend, FakeTransport, ServerSide, at, entry, eventually, inbound, me, post,
    summary,
};

async fn start(backend: &Arc<FakeBackend>, transport: &Arc<FakeTransport>) -> Arc<SyncCoordinator> {
    SyncCoordinator::start(
        SessionContext::new(me()),
        backend.clone(),
        transport.clone(),
        SyncConfig::default(),
    )
    .await
}

/// Accept the next connection and check its handshake.
async fn handshake(transport: &FakeTransport) -> ServerSide {
    let mut side = transport.accept().await;
    assert_eq!(
        side.commands.recv().await,
        Some(PushCommand::Identify {
            user_id: me().id
        })
    );
    assert_eq!(
        side.commands.recv().await,
        Some(PushCommand::Subscribe {
            kinds: EventKind::ALL.to_vec()
        })
    );
    side
}

async fn wait_connected(engine: &SyncCoordinator) {
    eventually("push connected", || async move { engine.status().push_connected }).await;
}

async fn wait_active(engine: &SyncCoordinator, thread: &str) {
    let want = Some(ThreadId::from(thread));
    let want = &want;
    eventually("active thread selected", || async move {
        engine.active_thread().await.map(|t| t.id) == Some(want.clone())
    })
    .await;
}

async fn active_len(engine: &SyncCoordinator) -> usize {
    engine
        .active_thread()
        .await
        .map(|t| t.messages.len())
        .unwrap_or(0)
}

#[tokio::test(start_paused = true)]
async fn push_message_is_not_duplicated_by_reconcile() {
    let backend = FakeBackend::new();
    backend.set_thread_list(vec![summary(Some("t1"), "u2", false)]);
    backend.set_history("t1", vec![]);
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let side = handshake(&transport).await;
    wait_active(&engine, "t1").await;
    let mut updates = engine.subscribe();

    side.events
        .send(PushEvent::MessageCreate {
            id: None,
            thread_id: ThreadId::from("t1"),
            sender_id: UserId::from("u2"),
            body: "hello there".to_string(),
            timestamp: at(100),
        })
        .await
        .unwrap();
    let e = &engine;
    eventually("push message shown", || async move { active_len(e).await == 1 }).await;

    let mut forced = false;
    while let Ok(update) = updates.try_recv() {
        forced |= update == SyncUpdate::Autoscroll { force: true };
    }
    assert!(forced);

    // the server now reports the same message, with an id
    backend.set_history("t1", vec![entry(Some("m1"), "u2", "hello there", 100)]);
    let before = backend.count(|c| *c == Call::History(ThreadId::from("t1")));
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert!(backend.count(|c| *c == Call::History(ThreadId::from("t1"))) > before);
    assert_eq!(active_len(&engine).await, 1);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polled_message_reaches_active_thread() {
    let backend = FakeBackend::new();
    backend.set_thread_list(vec![summary(Some("t1"), "u2", false)]);
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    wait_active(&engine, "t1").await;

    backend.queue_new_messages(vec![
        inbound(Some("m4"), "t1", "u2", "from the poll", 7),
        inbound(Some("m4"), "t1", "u2", "from the poll", 7),
    ]);
    let e = &engine;
    eventually("polled message shown", || async move { active_len(e).await == 1 }).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(active_len(&engine).await, 1);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn message_for_unknown_thread_refreshes_list() {
    let backend = FakeBackend::new();
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let side = handshake(&transport).await;

    backend.set_thread_list(vec![summary(Some("t5"), "u4", true)]);
    backend.set_history("t5", vec![entry(Some("m9"), "u4", "are you new here?", 3)]);
    side.events
        .send(PushEvent::MessageCreate {
            id: Some("m9".into()),
            thread_id: ThreadId::from("t5"),
            sender_id: UserId::from("u4"),
            body: "are you new here?".to_string(),
            timestamp: at(3),
        })
        .await
        .unwrap();

    wait_active(&engine, "t5").await;
    let e = &engine;
    eventually("history loaded", || async move { active_len(e).await == 1 }).await;
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_resends_identify_and_subscribe() {
    let backend = FakeBackend::new();
    let transport = FakeTransport::refusing(1);
    let engine = start(&backend, &transport).await;

    let first = handshake(&transport).await;
    wait_connected(&engine).await;
    assert_eq!(transport.connects.load(std::sync::atomic::Ordering::SeqCst), 2);

    drop(first);
    let e = &engine;
    eventually("push down", || async move { !e.status().push_connected }).await;

    let _second = handshake(&transport).await;
    wait_connected(&engine).await;
    assert_eq!(transport.connects.load(std::sync::atomic::Ordering::SeqCst), 3);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stopped_engine_issues_no_mutation() {
    let backend = FakeBackend::new();
    backend.set_thread_list(vec![summary(Some("t1"), "u2", false)]);
    let gate = backend.hold("thread_list");
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;

    let b = &backend;
    eventually("thread list requested", || async move {
        b.count(|c| *c == Call::ThreadList) >= 1
    })
    .await;
    engine.stop().await;
    gate.notify_waiters();
    backend.release("thread_list");

    let calls_at_stop = backend.calls().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.calls().len(), calls_at_stop);
    assert!(engine.threads().await.is_empty());

    let late = engine
        .thread_store()
        .apply_inbound(InboundMessage::from(inbound(Some("m1"), "t1", "u2", "late", 1)))
        .await;
    assert_eq!(late, InboundOutcome::Closed);
    assert!(matches!(
        engine.send(&UserRef::new("u2", "bo"), "hi").await,
        Err(SyncError::Stopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn send_completing_after_stop_does_not_adopt_thread() {
    let backend = FakeBackend::new();
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let gate = backend.hold("create_thread");

    let sender = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send(&UserRef::new("u7", "cy"), "hi").await })
    };
    let b = &backend;
    eventually("create requested", || async move {
        b.count(|c| matches!(c, Call::CreateThread { .. })) == 1
    })
    .await;

    engine.stop().await;
    gate.notify_one();
    let receipt = sender.await.unwrap().unwrap();
    assert!(receipt.created);

    let thread = engine.thread_store().thread(&UserId::from("u7")).await.unwrap();
    assert_eq!(thread.id, None);
}

#[tokio::test(start_paused = true)]
async fn bell_count_accumulates_into_session() {
    let backend = FakeBackend::new();
    backend.set_thread_list(vec![summary(Some("t1"), "u2", false)]);
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let side = handshake(&transport).await;
    wait_active(&engine, "t1").await;

    side.events.send(PushEvent::BellCount { count: 2 }).await.unwrap();
    side.events.send(PushEvent::BellCount { count: 3 }).await.unwrap();
    let e = &engine;
    eventually("bell counted", || async move { e.bell_count() == 5 }).await;

    let session = engine.stop().await;
    assert_eq!(session.bell_count, 5);
    assert_eq!(session.last_active_peer, Some(UserId::from("u2")));
}

#[tokio::test(start_paused = true)]
async fn bell_count_saturates_instead_of_wrapping() {
    let backend = FakeBackend::new();
    backend.set_thread_list(vec![summary(Some("t1"), "u2", false)]);
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let side = handshake(&transport).await;

    side.events.send(PushEvent::BellCount { count: i64::MAX - 1 }).await.unwrap();
    side.events.send(PushEvent::BellCount { count: 5 }).await.unwrap();
    let e = &engine;
    eventually("bell pinned", || async move { e.bell_count() == i64::MAX }).await;

    side.events.send(PushEvent::BellCount { count: 1 }).await.unwrap();
    let session = engine.stop().await;
    assert_eq!(session.bell_count, i64::MAX);
}

#[tokio::test(start_paused = true)]
async fn liking_a_post_rings_the_author() {
    let backend = FakeBackend::new();
    backend.set_posts(vec![post("p1", "u9", 1)]);
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let mut side = handshake(&transport).await;
    wait_connected(&engine).await;
    let e = &engine;
    eventually("feed loaded", || async move { e.feed().await.len() == 1 }).await;

    let likes = engine
        .toggle_like(&FeedQuery::global(), &PostId::from("p1"))
        .await
        .unwrap();
    assert!(likes.liked_by_viewer);
    assert_eq!(
        side.commands.recv().await,
        Some(PushCommand::SendBell {
            target_user_id: UserId::from("u9"),
            count: 1
        })
    );
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn author_feed_loads_on_first_use() {
    let backend = FakeBackend::new();
    backend.set_posts(vec![post("p1", "u9", 1), post("p2", "u3", 2)]);
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;

    let author = UserId::from("u3");
    let feed = engine.author_feed(&author).unwrap();
    let f = &feed;
    eventually("author feed loaded", || async move { f.items().await.len() == 1 }).await;
    assert_eq!(feed.items().await[0].post_id, PostId::from("p2"));
    assert!(
        backend
            .calls()
            .iter()
            .any(|c| matches!(c, Call::GetFeed { author: Some(a), .. } if *a == author))
    );
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn feed_scroll_loads_only_near_the_end() {
    let backend = FakeBackend::new();
    backend.set_posts((1..=7).map(|i| post(&format!("p{}", i), "u9", i)).collect());
    let transport = FakeTransport::new();
    let engine = start(&backend, &transport).await;
    let e = &engine;
    eventually("first page", || async move { e.feed().await.len() == 5 }).await;

    let global = FeedQuery::global();
    let far = Viewport::new(0.0, 600.0, 2000.0);
    assert_eq!(engine.on_feed_scroll(&global, &far).await.unwrap(), None);

    let near = Viewport::new(1350.0, 600.0, 2000.0);
    let outcome = engine.on_feed_scroll(&global, &near).await.unwrap();
    assert_eq!(outcome, Some(PageOutcome::Appended { added: 2 }));
    engine.stop().await;
}
