use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use chatsync_core::membership::resolve_chats;
use chatsync_core::{
    Author, ChatFactory, ChatMembershipIndex, LifecycleScope, MessageStream, StreamState,
    SyncConfig, SyncContext, SyncError, SyncEvent, SyncObserver, UserDirectory,
};
use chatsync_store::{MemoryStore, SqliteStore, StoreClient};
use chatsync_types::api::{CreateChatRequest, RegisterRequest};
use chatsync_types::models::{Chat, Message};

const WAIT: Duration = Duration::from_secs(2);

struct RecordingObserver(UnboundedSender<SyncEvent>);

impl SyncObserver for RecordingObserver {
    fn observe(&self, event: SyncEvent) {
        let _ = self.0.send(event);
    }
}

fn context_with(
    store: Arc<dyn StoreClient>,
    config: SyncConfig,
) -> (SyncContext, UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = unbounded_channel();
    let ctx = SyncContext::new(store, config).with_observer(Arc::new(RecordingObserver(tx)));
    (ctx, rx)
}

fn context(store: &MemoryStore) -> (SyncContext, UnboundedReceiver<SyncEvent>) {
    context_with(Arc::new(store.clone()), SyncConfig::default())
}

fn author() -> Author {
    Author {
        id: "u1".into(),
        username: "alice".into(),
    }
}

fn team(names: &[&str]) -> CreateChatRequest {
    CreateChatRequest {
        name: "Team".into(),
        participant_usernames: names.iter().map(|s| s.to_string()).collect(),
        requester_id: "u1".into(),
        requester_username: "alice".into(),
    }
}

fn people() -> Value {
    json!({
        "users": {
            "u1": { "username": "alice" },
            "u2": { "username": "bob" },
        }
    })
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

async fn wait_for_event<F>(events: &mut UnboundedReceiver<SyncEvent>, matches: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    loop {
        let event = next(events).await;
        if matches(&event) {
            return event;
        }
    }
}

fn chat_ids(chats: &[Chat]) -> Vec<&str> {
    chats.iter().map(|c| c.id.as_str()).collect()
}

fn message_ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

fn children(store: &MemoryStore, pointer: &str) -> usize {
    store
        .dump()
        .pointer(pointer)
        .and_then(Value::as_object)
        .map_or(0, |m| m.len())
}

// -- Chat list --

#[tokio::test]
async fn chat_list_orders_by_recency_with_empty_chats_last() {
    let store = MemoryStore::with_data(json!({
        "chats": {
            "c1": { "name": "one", "lastMessageAt": 100 },
            "c2": { "name": "two" },
        },
        "userChats": { "u1": { "c1": { "addedAt": 1 }, "c2": { "addedAt": 2 } } },
    }));
    let (ctx, _events) = context(&store);

    let (tx, mut rx) = unbounded_channel();
    let _sub = ChatMembershipIndex::new(&ctx)
        .subscribe("u1", move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();

    let chats = next(&mut rx).await.unwrap();
    assert_eq!(chat_ids(&chats), vec!["c1", "c2"]);
    assert_eq!(chats[1].last_message_at, None);
}

#[tokio::test]
async fn slow_older_batch_never_overwrites_newer_list() {
    let store = MemoryStore::with_data(json!({
        "chats": {
            "c0": { "name": "zero" },
            "c1": { "name": "one" },
        },
        "userChats": { "u1": { "c0": { "addedAt": 1 } } },
    }));
    store.delay_next_read("chats/c0", Duration::from_millis(300));
    let (ctx, mut events) = context(&store);

    let (tx, mut rx) = unbounded_channel();
    let _sub = ChatMembershipIndex::new(&ctx)
        .subscribe("u1", move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();

    store
        .write("userChats/u1", json!({ "c1": { "addedAt": 2 } }))
        .await
        .unwrap();

    let chats = next(&mut rx).await.unwrap();
    assert_eq!(chat_ids(&chats), vec!["c1"]);

    let stale = wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::StaleBatchDiscarded { .. })
    })
    .await;
    assert_eq!(
        stale,
        SyncEvent::StaleBatchDiscarded {
            user_id: "u1".into(),
            generation: 1,
            latest: 2,
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "stale list was emitted");
}

#[tokio::test]
async fn chat_list_follows_new_memberships() {
    let store = MemoryStore::with_data(people());
    let (ctx, _events) = context(&store);

    let (tx, mut rx) = unbounded_channel();
    let _sub = ChatMembershipIndex::new(&ctx)
        .subscribe("u2", move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert!(next(&mut rx).await.unwrap().is_empty());

    let chat_id = ChatFactory::new(&ctx).create(team(&["bob"])).await.unwrap();

    // The chat record lands before the membership entries.
    let chats = next(&mut rx).await.unwrap();
    assert_eq!(chat_ids(&chats), vec![chat_id.as_str()]);
    assert_eq!(chats[0].participant_usernames, vec!["alice", "bob"]);
}

#[tokio::test]
async fn chat_list_read_failure_reaches_caller() {
    let store = MemoryStore::with_data(json!({
        "chats": { "c1": { "name": "one" } },
        "userChats": { "u1": { "c1": true } },
    }));
    store.fail_reads_under("chats");
    let (ctx, _events) = context(&store);

    let (tx, mut rx) = unbounded_channel();
    let _sub = ChatMembershipIndex::new(&ctx)
        .subscribe("u1", move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();

    let err = next(&mut rx).await.unwrap_err();
    assert_eq!(err.reason(), "store_unavailable");
}

// -- Message stream --

#[tokio::test]
async fn messages_order_by_time_then_id() {
    let store = MemoryStore::with_data(json!({
        "chats": { "c1": { "name": "one" } },
        "messages": { "c1": {
            "b": { "body": "second", "createdAt": 5 },
            "a": { "body": "first", "createdAt": 3 },
            "c": { "body": "third", "createdAt": 5 },
        } },
    }));
    let (ctx, _events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    let (tx, mut rx) = unbounded_channel();
    let _sub = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();

    let window = next(&mut rx).await.unwrap();
    assert_eq!(message_ids(&window), vec!["a", "b", "c"]);
    assert_eq!(stream.state(), StreamState::Subscribed);
}

#[tokio::test]
async fn legacy_shapes_are_normalized() {
    let store = MemoryStore::with_data(json!({
        "chatMessages": { "c7": {
            "k1": "hello",
            "k2": { "text": "later", "timestamp": "7" },
        } },
    }));
    let (ctx, _events) = context(&store);
    let stream = MessageStream::open(&ctx, "c7", author()).await.unwrap();
    assert_eq!(stream.location().path, "chatMessages/c7");

    let (tx, mut rx) = unbounded_channel();
    let _sub = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();

    let window = next(&mut rx).await.unwrap();
    assert_eq!(message_ids(&window), vec!["k1", "k2"]);
    assert_eq!(window[0].body, "hello");
    assert_eq!(window[0].sender_username, "unknown");
    assert_eq!(window[1].body, "later");
    assert_eq!(window[1].created_at, 7);
}

#[tokio::test]
async fn blank_sends_write_nothing() {
    let store = MemoryStore::with_data(json!({
        "chats": { "c1": { "name": "one", "lastMessage": "old", "lastMessageAt": 9 } },
        "messages": { "c1": { "m1": { "body": "old", "createdAt": 9 } } },
    }));
    let (ctx, _events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();
    let before = store.dump();

    assert_eq!(stream.send("").await.unwrap(), None);
    assert_eq!(stream.send("   ").await.unwrap(), None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.dump(), before);
}

#[tokio::test]
async fn load_older_on_empty_chat_reports_no_more() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    let (ctx, _events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();
    assert!(stream.location().is_canonical());

    let (tx, mut rx) = unbounded_channel();
    let _sub = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert!(next(&mut rx).await.unwrap().is_empty());

    let page = stream.load_older().await.unwrap();
    assert!(!page.more);
    assert!(stream.window().is_empty());
    assert_eq!(stream.state(), StreamState::Subscribed);
}

#[tokio::test]
async fn older_pages_are_prepended() {
    let mut messages = serde_json::Map::new();
    for i in 1..=5 {
        messages.insert(format!("m{}", i), json!({ "body": i.to_string(), "createdAt": i }));
    }
    let store = MemoryStore::with_data(json!({
        "chats": { "c1": { "name": "one" } },
        "messages": { "c1": messages },
    }));
    let config = SyncConfig {
        page_size: 2,
        ..SyncConfig::default()
    };
    let (ctx, _events) = context_with(Arc::new(store.clone()), config);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    let (tx, mut rx) = unbounded_channel();
    let _sub = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert_eq!(message_ids(&next(&mut rx).await.unwrap()), vec!["m4", "m5"]);

    assert!(stream.load_older().await.unwrap().more);
    assert_eq!(
        message_ids(&next(&mut rx).await.unwrap()),
        vec!["m2", "m3", "m4", "m5"]
    );

    assert!(!stream.load_older().await.unwrap().more);
    assert_eq!(
        message_ids(&stream.window()),
        vec!["m1", "m2", "m3", "m4", "m5"]
    );

    assert!(!stream.load_older().await.unwrap().more);
    assert_eq!(stream.window().len(), 5);

    // New messages still arrive at the live end.
    store
        .write("messages/c1/m6", json!({ "body": "6", "createdAt": 6 }))
        .await
        .unwrap();
    loop {
        let window = next(&mut rx).await.unwrap();
        if window.len() == 6 {
            assert_eq!(window.last().map(|m| m.id.as_str()), Some("m6"));
            break;
        }
    }
}

#[tokio::test]
async fn location_is_resolved_once_across_reconnects() {
    let store = MemoryStore::with_data(json!({
        "chats": { "c5": {
            "name": "five",
            "messages": { "x1": { "body": "hi", "createdAt": 1 } },
        } },
    }));
    let (ctx, mut events) = context(&store);
    let stream = MessageStream::open(&ctx, "c5", author()).await.unwrap();
    assert_eq!(stream.location().path, "chats/c5/messages");

    let (tx, mut rx) = unbounded_channel();
    let _sub = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert_eq!(message_ids(&next(&mut rx).await.unwrap()), vec!["x1"]);

    store.disconnect_watchers();
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::Reattached { .. })).await;

    store
        .write("chats/c5/messages/x2", json!({ "body": "again", "createdAt": 2 }))
        .await
        .unwrap();
    loop {
        let window = next(&mut rx).await.unwrap();
        if window.len() == 2 {
            assert_eq!(message_ids(&window), vec!["x1", "x2"]);
            break;
        }
    }

    assert_eq!(store.read_count("messages/c5"), 1);
    assert_eq!(store.read_count("chatMessages/c5"), 1);
    assert_eq!(store.read_count("chats/c5/messages"), 1);
    assert_eq!(stream.location().path, "chats/c5/messages");
}

#[tokio::test]
async fn send_updates_chat_summary() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    let (ctx, mut events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    let id = stream.send("  hello  ").await.unwrap().unwrap();
    let event = wait_for_event(&mut events, is_summary_outcome).await;
    assert_eq!(
        event,
        SyncEvent::SummaryUpdated {
            chat_id: "c1".into(),
            message_id: id.clone(),
        }
    );

    let stored = store.read(&format!("messages/c1/{}", id)).await.unwrap().unwrap();
    assert_eq!(stored["body"], "hello");
    assert_eq!(stored["senderUsername"], "alice");
    assert_eq!(store.read("chats/c1/lastMessage").await.unwrap(), Some(json!("hello")));
    assert_eq!(store.read("chats/c1/lastMessageAt").await.unwrap(), Some(stored["createdAt"].clone()));
}

#[tokio::test]
async fn summary_failure_does_not_fail_send() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    store.fail_writes_under("chats/c1");
    let (ctx, mut events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    let id = stream.send("hello").await.unwrap().unwrap();
    let event = wait_for_event(&mut events, is_summary_outcome).await;
    assert!(
        matches!(event, SyncEvent::SummaryUpdateFailed { ref message_id, .. } if *message_id == id)
    );
    assert!(store.exists(&format!("messages/c1/{}", id)).await.unwrap());
    assert_eq!(store.read("chats/c1/lastMessage").await.unwrap(), None);
}

fn is_summary_outcome(event: &SyncEvent) -> bool {
    matches!(
        event,
        SyncEvent::SummaryUpdated { .. }
            | SyncEvent::SummarySuperseded { .. }
            | SyncEvent::SummaryUpdateFailed { .. }
    )
}

#[tokio::test]
async fn late_summary_from_one_stream_keeps_newest_message() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    let (ctx, mut events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    store.delay_next_read("chats/c1", Duration::from_millis(200));
    stream.send("first").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = stream.send("second").await.unwrap().unwrap();

    for _ in 0..2 {
        let event = wait_for_event(&mut events, is_summary_outcome).await;
        assert!(matches!(event, SyncEvent::SummaryUpdated { .. }), "{}", event);
    }
    assert_eq!(store.read("chats/c1/lastMessage").await.unwrap(), Some(json!("second")));
    assert_eq!(store.read("chats/c1/lastMessageId").await.unwrap(), Some(json!(second)));
}

#[tokio::test]
async fn summary_never_moves_backwards_across_streams() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    let (ctx, mut events) = context(&store);
    let slow = MessageStream::open(&ctx, "c1", author()).await.unwrap();
    let fast = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    store.delay_next_read("chats/c1", Duration::from_millis(200));
    let first = slow.send("first").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = fast.send("second").await.unwrap().unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        outcomes.push(wait_for_event(&mut events, is_summary_outcome).await);
    }
    assert_eq!(
        outcomes,
        vec![
            SyncEvent::SummaryUpdated {
                chat_id: "c1".into(),
                message_id: second,
            },
            SyncEvent::SummarySuperseded {
                chat_id: "c1".into(),
                message_id: first,
            },
        ]
    );
    assert_eq!(store.read("chats/c1/lastMessage").await.unwrap(), Some(json!("second")));
}

#[tokio::test]
async fn subscribing_during_pagination_ends_subscribed() {
    let store = MemoryStore::with_data(json!({
        "chats": { "c1": { "name": "one" } },
        "messages": { "c1": {
            "m1": { "body": "1", "createdAt": 1 },
            "m2": { "body": "2", "createdAt": 2 },
            "m3": { "body": "3", "createdAt": 3 },
        } },
    }));
    let config = SyncConfig {
        page_size: 2,
        ..SyncConfig::default()
    };
    let (ctx, _events) = context_with(Arc::new(store.clone()), config);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    let (tx, mut rx) = unbounded_channel();
    let first = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert_eq!(message_ids(&next(&mut rx).await.unwrap()), vec!["m2", "m3"]);
    first.unsubscribe();
    assert_eq!(stream.state(), StreamState::Ready);

    store.delay_next_read("messages/c1", Duration::from_millis(200));
    let paging = tokio::spawn({
        let stream = stream.clone();
        async move { stream.load_older().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stream.state(), StreamState::Paginating);

    let _second = stream.subscribe(|_| {}).await.unwrap();
    assert_eq!(stream.state(), StreamState::Paginating);

    let page = paging.await.unwrap().unwrap();
    assert!(!page.more);
    assert_eq!(stream.state(), StreamState::Subscribed);
    assert_eq!(message_ids(&stream.window()), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn summary_never_recreates_a_vanished_chat() {
    let store = MemoryStore::new();
    let (ctx, mut events) = context(&store);
    let stream = MessageStream::open(&ctx, "gone", author()).await.unwrap();

    stream.send("anyone?").await.unwrap().unwrap();
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::SummaryUpdateFailed { .. })).await;
    assert!(!store.exists("chats/gone").await.unwrap());
}

#[tokio::test]
async fn closed_stream_rejects_further_use() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    let (ctx, _events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();
    let _sub = stream.subscribe(|_| {}).await.unwrap();
    assert_eq!(store.watcher_count(), 1);

    stream.close();
    stream.close();
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(store.watcher_count(), 0);
    assert!(matches!(stream.send("late").await, Err(SyncError::Closed)));
    assert!(matches!(stream.load_older().await, Err(SyncError::Closed)));
}

#[tokio::test]
async fn resubscribing_replaces_the_listener() {
    let store = MemoryStore::with_data(json!({ "chats": { "c1": { "name": "one" } } }));
    let (ctx, _events) = context(&store);
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();

    let first = stream.subscribe(|_| {}).await.unwrap();
    let second = stream.subscribe(|_| {}).await.unwrap();
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(store.watcher_count(), 1);
}

// -- Chat creation --

#[tokio::test]
async fn create_is_idempotent() {
    let store = MemoryStore::with_data(people());
    let (ctx, _events) = context(&store);
    let factory = ChatFactory::new(&ctx);

    let first = factory.create(team(&["alice", "bob"])).await.unwrap();
    let second = factory.create(team(&["alice", "bob"])).await.unwrap();
    assert_eq!(first, second);

    assert_eq!(children(&store, "/chats"), 1);
    assert_eq!(children(&store, "/userChats/u1"), 1);
    assert_eq!(children(&store, "/userChats/u2"), 1);

    let chat = store.read(&format!("chats/{}", first)).await.unwrap().unwrap();
    assert_eq!(chat["createdBy"], "u1");
    assert_eq!(chat["participantIds"], json!(["u1", "u2"]));
    assert!(chat.get("lastMessage").is_none());
}

#[tokio::test]
async fn dedup_ignores_participant_order() {
    let store = MemoryStore::with_data(people());
    let (ctx, _events) = context(&store);
    let factory = ChatFactory::new(&ctx);

    let first = factory.create(team(&["alice", "bob"])).await.unwrap();
    let mut reordered = team(&["bob", "alice"]);
    reordered.name = "  Team ".into();
    assert_eq!(factory.create(reordered).await.unwrap(), first);
    assert_eq!(children(&store, "/chats"), 1);

    // A different set is a different chat.
    let solo = factory.create(team(&[])).await.unwrap();
    assert_ne!(solo, first);
}

#[tokio::test]
async fn unknown_username_creates_nothing() {
    let store = MemoryStore::with_data(people());
    let (ctx, _events) = context(&store);

    let err = ChatFactory::new(&ctx)
        .create(team(&["bob", "carol"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(ref name) if name == "carol"));
    assert_eq!(store.dump(), MemoryStore::with_data(people()).dump());
}

#[tokio::test]
async fn blank_chat_name_is_rejected() {
    let store = MemoryStore::with_data(people());
    let (ctx, _events) = context(&store);

    let mut req = team(&["bob"]);
    req.name = "   ".into();
    let err = ChatFactory::new(&ctx).create(req).await.unwrap_err();
    assert_eq!(err.reason(), "validation");
    assert_eq!(children(&store, "/chats"), 0);
}

#[tokio::test]
async fn failed_membership_writes_are_reported() {
    let store = MemoryStore::with_data(people());
    store.fail_writes_under("userChats/u2");
    let (ctx, _events) = context(&store);

    let err = ChatFactory::new(&ctx).create(team(&["bob"])).await.unwrap_err();
    let SyncError::PartialWrite { chat_id, failed_user_ids } = err else {
        panic!("expected a partial write, got {:?}", err);
    };
    assert_eq!(failed_user_ids, vec!["u2"]);
    assert!(store.exists(&format!("chats/{}", chat_id)).await.unwrap());
    assert!(store.exists(&format!("userChats/u1/{}", chat_id)).await.unwrap());
}

// -- Lifecycle --

#[tokio::test]
async fn teardown_releases_every_listener() {
    let store = MemoryStore::with_data(json!({
        "chats": { "c1": { "name": "one" } },
        "userChats": { "u1": { "c1": true } },
    }));
    let (ctx, _events) = context(&store);
    let scope = LifecycleScope::new("session:u1");

    scope.attach(ChatMembershipIndex::new(&ctx).subscribe("u1", |_| {}).await.unwrap());
    let stream = MessageStream::open(&ctx, "c1", author()).await.unwrap();
    scope.attach(stream.subscribe(|_| {}).await.unwrap());
    assert_eq!(store.watcher_count(), 2);

    assert_eq!(scope.teardown(), 2);
    assert_eq!(store.watcher_count(), 0);
    assert_eq!(stream.state(), StreamState::Ready);
}

#[tokio::test]
async fn subscribe_failure_leaves_no_listener() {
    let store = MemoryStore::new();
    store.fail_reads_under("userChats");
    let (ctx, _events) = context(&store);

    let err = ChatMembershipIndex::new(&ctx)
        .subscribe("u1", |_| {})
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "store_unavailable");
    assert_eq!(store.watcher_count(), 0);
}

// -- SQLite backend --

#[tokio::test]
async fn full_flow_on_sqlite() {
    let path = std::env::temp_dir().join(format!("chatsync-flow-{}.db", std::process::id()));
    remove_db(&path);
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let (ctx, mut events) = context_with(store.clone(), SyncConfig::default());

    let users = UserDirectory::new(&ctx);
    let alice = users
        .register(RegisterRequest {
            username: "alice".into(),
            password: "correct horse".into(),
        })
        .await
        .unwrap();
    users
        .register(RegisterRequest {
            username: "bob".into(),
            password: "battery staple".into(),
        })
        .await
        .unwrap();

    let chat_id = ChatFactory::new(&ctx)
        .create(CreateChatRequest {
            name: "Team".into(),
            participant_usernames: vec!["bob".into()],
            requester_id: alice.id.clone(),
            requester_username: alice.username.clone(),
        })
        .await
        .unwrap();

    let (tx, mut chats) = unbounded_channel();
    let _list = ChatMembershipIndex::new(&ctx)
        .subscribe(&alice.id, move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert_eq!(chat_ids(&next(&mut chats).await.unwrap()), vec![chat_id.as_str()]);

    let stream = MessageStream::open(
        &ctx,
        &chat_id,
        Author {
            id: alice.id.clone(),
            username: alice.username.clone(),
        },
    )
    .await
    .unwrap();
    let (tx, mut window) = unbounded_channel();
    let _messages = stream
        .subscribe(move |r| {
            let _ = tx.send(r);
        })
        .await
        .unwrap();
    assert!(next(&mut window).await.unwrap().is_empty());

    stream.send("hello").await.unwrap().unwrap();
    let delivered = next(&mut window).await.unwrap();
    assert_eq!(delivered[0].body, "hello");

    wait_for_event(&mut events, |e| matches!(e, SyncEvent::SummaryUpdated { .. })).await;
    let listed = resolve_chats(store.as_ref(), &[chat_id.clone()]).await.unwrap();
    assert_eq!(listed[0].last_message.as_deref(), Some("hello"));

    stream.close();
    remove_db(&path);
}

fn remove_db(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}
