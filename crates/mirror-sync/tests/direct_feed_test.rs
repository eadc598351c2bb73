//! Direct change-feed transport driven through the engine.

mod common;

use std::sync::{Arc, Mutex};

use common::{ids, next_event, next_non_empty, record, EventLog, MemoryFeed};
use mirror_core::{ChangeKind, FirstTimeGate, KeyedStore, ObjectCache, ParseAs, Record};
use mirror_sync::{
    ChangeListener, ListenerResult, SubscriptionConfig, SyncEngine, SyncError, TransportKind,
};
use serde_json::json;

fn engine(feed: Arc<MemoryFeed>) -> SyncEngine {
    SyncEngine::builder(KeyedStore::new_shared(), FirstTimeGate::new_shared())
        .direct_feed(feed)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_first_snapshot_populates_cache() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let (log, mut events) = EventLog::new();

    feed.push_initial("items", vec![record(json!({"id": "a"})), record(json!({"id": "b"}))]);
    engine
        .subscribe(vec![SubscriptionConfig::new("items").listener(log)])
        .await
        .unwrap();

    assert_eq!(ids(&engine.get_array("items")), vec!["a", "b"]);
    assert_eq!(
        next_event(&mut events).await,
        (ChangeKind::FirstTime, vec!["a".to_string(), "b".to_string()])
    );
    assert_eq!(engine.default_transport(), TransportKind::DirectFeed);
}

#[tokio::test]
async fn test_bootstrap_fires_once_per_cache_name() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let first_times = Arc::new(Mutex::new(0));

    let config = |counter: Arc<Mutex<i32>>| {
        SubscriptionConfig::new("items").on_first_time(move |_, _| {
            *counter.lock().unwrap() += 1;
            Ok(())
        })
    };

    feed.push_initial("items", vec![record(json!({"id": "a"}))]);
    engine.subscribe(vec![config(first_times.clone())]).await.unwrap();

    // Same cache name again, as after a reconnect.
    feed.close("items");
    let (log, mut events) = EventLog::new();
    feed.push_initial("items", vec![record(json!({"id": "a"})), record(json!({"id": "b"}))]);
    engine
        .subscribe(vec![config(first_times.clone()).listener(log)])
        .await
        .unwrap();

    assert_eq!(*first_times.lock().unwrap(), 1);
    assert_eq!(
        next_event(&mut events).await,
        (ChangeKind::Add, vec!["a".to_string(), "b".to_string()])
    );
    assert_eq!(ids(&engine.get_array("items")), vec!["a", "b"]);
}

#[tokio::test]
async fn test_incremental_batches_arrive_in_order() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let (log, mut events) = EventLog::new();

    feed.push_initial("items", vec![record(json!({"id": "a"})), record(json!({"id": "b"}))]);
    engine
        .subscribe(vec![SubscriptionConfig::new("items").listener(log)])
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await.0, ChangeKind::FirstTime);

    feed.push_changes(
        "items",
        vec![],
        vec![
            (ChangeKind::Remove, record(json!({"id": "a"}))),
            (ChangeKind::Modify, record(json!({"id": "b", "v": 2}))),
            (ChangeKind::Add, record(json!({"id": "c"}))),
        ],
    );

    assert_eq!(next_event(&mut events).await, (ChangeKind::Add, vec!["c".to_string()]));
    assert_eq!(next_event(&mut events).await, (ChangeKind::Modify, vec!["b".to_string()]));
    assert_eq!(next_event(&mut events).await, (ChangeKind::Remove, vec!["a".to_string()]));
    assert_eq!(ids(&engine.get_array("items")), vec!["c", "b"]);
}

#[tokio::test]
async fn test_empty_batches_are_delivered() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let (log, mut events) = EventLog::new();

    feed.push_initial("items", vec![]);
    engine
        .subscribe(vec![SubscriptionConfig::new("items").listener(log)])
        .await
        .unwrap();
    next_event(&mut events).await;

    feed.push_changes("items", vec![], vec![(ChangeKind::Modify, record(json!({"id": "x"})))]);

    assert_eq!(next_event(&mut events).await, (ChangeKind::Add, vec![]));
    assert_eq!(next_event(&mut events).await, (ChangeKind::Modify, vec!["x".to_string()]));
    assert_eq!(next_event(&mut events).await, (ChangeKind::Remove, vec![]));
}

#[tokio::test]
async fn test_object_shape_upsert_is_idempotent() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let (log, mut events) = EventLog::new();

    feed.push_initial("users", vec![record(json!({"id": "u1", "name": "Ada"}))]);
    engine
        .subscribe(vec![SubscriptionConfig::new("users")
            .cache_name("users_by_id")
            .parse_as(ParseAs::Object)
            .listener(log)])
        .await
        .unwrap();
    next_event(&mut events).await;

    let renamed = record(json!({"id": "u1", "name": "Grace"}));
    for _ in 0..2 {
        feed.push_changes("users", vec![], vec![(ChangeKind::Modify, renamed.clone())]);
        assert_eq!(next_non_empty(&mut events).await.0, ChangeKind::Modify);
    }

    let cached = engine.get_object("users_by_id", ObjectCache::new());
    assert_eq!(cached.len(), 1);
    assert_eq!(cached.get("u1"), Some(&renamed));
    // Shape consistency: array reads of a map-shaped name yield the default.
    assert!(engine.get_array("users_by_id").is_empty());
}

#[tokio::test]
async fn test_readiness_waits_for_every_collection() {
    let feed = MemoryFeed::new();
    let engine = Arc::new(engine(feed.clone()));

    feed.push_initial("b", vec![record(json!({"id": "1"}))]);

    let subscribing = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .subscribe(vec![SubscriptionConfig::new("a"), SubscriptionConfig::new("b")])
                .await
        })
    };

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!subscribing.is_finished());

    feed.push_initial("a", vec![]);
    subscribing.await.unwrap().unwrap();

    assert_eq!(engine.get_array("b").len(), 1);
    assert!(engine.get_array("a").is_empty());
}

#[tokio::test]
async fn test_feed_errors_do_not_reject_readiness() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());

    feed.push_error("items", "permission denied");
    feed.push_initial("items", vec![record(json!({"id": "a"}))]);

    engine
        .subscribe(vec![SubscriptionConfig::new("items")])
        .await
        .unwrap();
    assert_eq!(engine.get_array("items").len(), 1);
}

#[tokio::test]
async fn test_feed_closed_before_snapshot_fails_subscribe() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());

    feed.push_error("items", "gone");
    feed.close("items");

    let err = engine
        .subscribe(vec![SubscriptionConfig::new("items")])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::FeedClosed(_)));
}

struct Tagged(Arc<Mutex<Vec<&'static str>>>, &'static str);

impl ChangeListener for Tagged {
    fn on_first_time(&self, _: &[Record], _: &SubscriptionConfig) -> ListenerResult {
        self.0.lock().unwrap().push(self.1);
        Ok(())
    }
}

#[tokio::test]
async fn test_callback_runs_before_extra_listeners() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    feed.push_initial("items", vec![record(json!({"id": "a"}))]);
    engine
        .subscribe(vec![SubscriptionConfig::new("items")
            .listener(Arc::new(Tagged(order.clone(), "first")))
            .on_first_time(move |_, _| {
                seen.lock().unwrap().push("callback");
                Ok(())
            })
            .listener(Arc::new(Tagged(order.clone(), "second")))])
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["callback", "first", "second"]);
}

#[tokio::test]
async fn test_listener_failure_keeps_feed_running() {
    let feed = MemoryFeed::new();
    let engine = engine(feed.clone());
    let (log, mut events) = EventLog::new();

    feed.push_initial("items", vec![]);
    engine
        .subscribe(vec![SubscriptionConfig::new("items")
            .on_add(|records, _| {
                if records.is_empty() {
                    Ok(())
                } else {
                    Err("rejected".into())
                }
            })
            .listener(log)])
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, (ChangeKind::FirstTime, vec![]));

    // The add is stored but the callback rejects it, so the rest of that
    // snapshot never reaches the listener.
    feed.push_changes("items", vec![], vec![(ChangeKind::Add, record(json!({"id": "a"})))]);
    feed.push_changes("items", vec![], vec![(ChangeKind::Remove, record(json!({"id": "a"})))]);

    assert_eq!(
        next_non_empty(&mut events).await,
        (ChangeKind::Remove, vec!["a".to_string()])
    );
    assert!(engine.get_array("items").is_empty());
}
