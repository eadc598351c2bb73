//! In-memory stand-ins for the change feed, the relay key/value store and
//! the relay message bus.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mirror_core::{ChangeKind, ConnectionState, Record};
use mirror_sync::relay::protocol::{channel_name, record_key, StoredRecord};
use mirror_sync::{
    BusEvent, ChangeFeedSource, ChangeListener, DocumentChange, FeedEvent, FeedSnapshot,
    KeyValueStore, KeyValueWriter, ListenerResult, MessageBus, RelayMessage, SubscriptionConfig,
    SyncError, SyncResult, UpdateType,
};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

pub const PREFIX: &str = "collection_updates";

pub fn record(value: Value) -> Record {
    Record::try_from(value).unwrap()
}

pub fn ids(records: &[Record]) -> Vec<String> {
    records.iter().filter_map(Record::id).collect()
}

// =============================================================================
// Change Feed
// =============================================================================

/// Change feed whose channels exist before anyone opens them, so tests can
/// push snapshots ahead of `subscribe`.
#[derive(Default)]
pub struct MemoryFeed {
    senders: Mutex<HashMap<String, mpsc::Sender<FeedEvent>>>,
    receivers: Mutex<HashMap<String, mpsc::Receiver<FeedEvent>>>,
}

impl MemoryFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender(&self, collection: &str) -> mpsc::Sender<FeedEvent> {
        let mut senders = self.senders.lock().unwrap();
        senders
            .entry(collection.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(64);
                self.receivers
                    .lock()
                    .unwrap()
                    .insert(collection.to_string(), rx);
                tx
            })
            .clone()
    }

    pub fn push(&self, collection: &str, event: FeedEvent) {
        self.sender(collection).try_send(event).unwrap();
    }

    /// Pushes a snapshot whose changes mark every document as added.
    pub fn push_initial(&self, collection: &str, documents: Vec<Record>) {
        self.push(collection, FeedEvent::Snapshot(FeedSnapshot::initial(documents)));
    }

    pub fn push_changes(
        &self,
        collection: &str,
        documents: Vec<Record>,
        changes: Vec<(ChangeKind, Record)>,
    ) {
        let changes = changes
            .into_iter()
            .map(|(kind, record)| DocumentChange::new(kind, record))
            .collect();
        self.push(collection, FeedEvent::Snapshot(FeedSnapshot { documents, changes }));
    }

    pub fn push_error(&self, collection: &str, message: &str) {
        self.push(collection, FeedEvent::Error(message.to_string()));
    }

    /// Drops the producer side; the feed task sees the stream end. The next
    /// push starts a new feed.
    pub fn close(&self, collection: &str) {
        self.senders.lock().unwrap().remove(collection);
    }
}

#[async_trait]
impl ChangeFeedSource for MemoryFeed {
    async fn open_change_feed(&self, collection: &str) -> SyncResult<mpsc::Receiver<FeedEvent>> {
        if let Some(rx) = self.receivers.lock().unwrap().remove(collection) {
            return Ok(rx);
        }

        // Nothing pending: start a fresh feed for this collection.
        let (tx, rx) = mpsc::channel(64);
        self.senders
            .lock()
            .unwrap()
            .insert(collection.to_string(), tx);
        Ok(rx)
    }
}

// =============================================================================
// Key/Value Store
// =============================================================================

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
    hold_scans: AtomicBool,
    fail_scans: AtomicBool,
    release: Notify,
    pub scan_started: Notify,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_raw(&self, key: &str, raw: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), raw.to_string());
    }

    pub fn insert(&self, collection: &str, record: &Record) {
        let key = record_key(collection, &record.id().unwrap());
        let raw = StoredRecord::new(record).to_json().unwrap();
        self.insert_raw(&key, &raw);
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, collection: &str, id: &str) {
        self.entries.lock().unwrap().remove(&record_key(collection, id));
    }

    /// Makes every scan wait for [`release_scan`](Self::release_scan).
    pub fn hold_scans(&self) {
        self.hold_scans.store(true, Ordering::SeqCst);
    }

    pub fn release_scan(&self) {
        self.hold_scans.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub fn fail_scans(&self) {
        self.fail_scans.store(true, Ordering::SeqCst);
    }
}

/// Glob match for the `prefix*` patterns the relay issues.
fn matches_pattern(pattern: &str, key: &str) -> bool {
    let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
    let mut literal = String::with_capacity(prefix.len());
    let mut escaped = false;
    for c in prefix.chars() {
        if c == '\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        literal.push(c);
    }
    key.starts_with(&literal)
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    /// The key set is taken when the scan starts; a held scan returns it
    /// after release, like a SCAN cursor that finished before later writes.
    async fn scan_keys(&self, pattern: &str) -> SyncResult<Vec<String>> {
        let keys: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect();

        self.scan_started.notify_one();
        if self.hold_scans.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(SyncError::Disconnected("scan failed".into()));
        }
        Ok(keys)
    }

    async fn bulk_get(&self, keys: &[String]) -> SyncResult<Vec<Option<String>>> {
        let entries = self.entries.lock().unwrap();
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

// =============================================================================
// Message Bus
// =============================================================================

#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Vec<(String, mpsc::Sender<BusEvent>)>>,
    pub subscribed: Notify,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn senders(&self, channel: &str) -> Vec<mpsc::Sender<BusEvent>> {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| matches_pattern(pattern, channel))
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    pub async fn publish_raw(&self, channel: &str, payload: &str) {
        for tx in self.senders(channel) {
            let _ = tx
                .send(BusEvent::Message {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .await;
        }
    }

    pub async fn publish(&self, collection: &str, update_type: UpdateType, record: &Record) {
        let payload = RelayMessage::new(collection, update_type, record)
            .to_json()
            .unwrap();
        self.publish_raw(&channel_name(PREFIX, collection), &payload).await;
    }

    /// Simulates the subscriber connection coming back after a drop.
    pub async fn resubscribe(&self) {
        let senders: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(BusEvent::Resubscribed).await;
        }
    }

    /// Simulates the subscriber giving up for good.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe_pattern(&self, pattern: &str) -> SyncResult<mpsc::Receiver<BusEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .lock()
            .unwrap()
            .push((pattern.to_string(), tx));
        self.subscribed.notify_one();
        Ok(rx)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.subscribers.lock().unwrap().is_empty() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Connected
        }
    }
}

/// Writer side over the in-memory store and bus.
pub struct MemoryRelay {
    pub kv: Arc<MemoryKv>,
    pub bus: Arc<MemoryBus>,
}

#[async_trait]
impl KeyValueWriter for MemoryRelay {
    async fn put(&self, key: &str, value: String) -> SyncResult<()> {
        self.kv.insert_raw(key, &value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.kv.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> SyncResult<()> {
        self.bus.publish_raw(channel, &payload).await;
        Ok(())
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Listener forwarding `(kind, ids)` for every delivered event.
pub struct EventLog {
    tx: mpsc::UnboundedSender<(ChangeKind, Vec<String>)>,
}

impl EventLog {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ChangeKind, Vec<String>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(EventLog { tx }), rx)
    }

    fn log(&self, kind: ChangeKind, records: &[Record]) -> ListenerResult {
        let _ = self.tx.send((kind, ids(records)));
        Ok(())
    }
}

impl ChangeListener for EventLog {
    fn on_first_time(&self, records: &[Record], _: &SubscriptionConfig) -> ListenerResult {
        self.log(ChangeKind::FirstTime, records)
    }

    fn on_add(&self, records: &[Record], _: &SubscriptionConfig) -> ListenerResult {
        self.log(ChangeKind::Add, records)
    }

    fn on_modify(&self, records: &[Record], _: &SubscriptionConfig) -> ListenerResult {
        self.log(ChangeKind::Modify, records)
    }

    fn on_remove(&self, records: &[Record], _: &SubscriptionConfig) -> ListenerResult {
        self.log(ChangeKind::Remove, records)
    }
}

/// Next logged event, failing the test after a generous timeout.
pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(ChangeKind, Vec<String>)>,
) -> (ChangeKind, Vec<String>) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event log closed")
}

/// Next logged event that is not an empty batch.
pub async fn next_non_empty(
    rx: &mut mpsc::UnboundedReceiver<(ChangeKind, Vec<String>)>,
) -> (ChangeKind, Vec<String>) {
    loop {
        let event = next_event(rx).await;
        if !event.1.is_empty() {
            return event;
        }
    }
}
