//! # Direct Feed Transport
//!
//! Subscribes to each collection's native change feed. Every snapshot the
//! feed emits carries the full document set plus the per-document changes
//! since the previous snapshot.
//!
//! ## Snapshot Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Direct Feed (one task per config)                   │
//! │                                                                         │
//! │  ChangeFeedSource::open_change_feed(collection)                         │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  FeedEvent::Snapshot ──► cache name bootstrapped?                       │
//! │          │                  │ no                   │ yes                │
//! │          │                  ▼                      ▼                    │
//! │          │            first_time(documents)   add ─► modify ─► remove   │
//! │          │            resolve readiness       (from snapshot.changes)   │
//! │          │                                                              │
//! │  FeedEvent::Error ────► logged, readiness untouched                     │
//! │  stream closed ───────► task ends; readiness fails if still pending     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping the feed receiver is the unsubscribe signal for the source.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mirror_core::{ChangeEvent, ChangeKind, Record};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{SyncError, SyncResult};
use crate::subscription::SubscriptionConfig;
use crate::transport::{Readiness, ReadySignal, Transport, TransportKind};

// =============================================================================
// Feed Types
// =============================================================================

/// One document-level change inside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// `Add`, `Modify` or `Remove`.
    pub kind: ChangeKind,
    pub record: Record,
}

impl DocumentChange {
    pub fn new(kind: ChangeKind, record: Record) -> Self {
        DocumentChange { kind, record }
    }
}

/// Full document set plus changes since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub documents: Vec<Record>,
    pub changes: Vec<DocumentChange>,
}

impl FeedSnapshot {
    /// Builds an initial snapshot where every document is an addition.
    pub fn initial(documents: Vec<Record>) -> Self {
        let changes = documents
            .iter()
            .cloned()
            .map(|record| DocumentChange::new(ChangeKind::Add, record))
            .collect();
        FeedSnapshot { documents, changes }
    }

    /// Splits `changes` into add, modify and remove events for
    /// `collection_name`, in that order. A `FirstTime` change kind is
    /// treated as an addition.
    pub fn partition(&self, collection_name: &str) -> [ChangeEvent; 3] {
        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut removed = Vec::new();

        for change in &self.changes {
            match change.kind {
                ChangeKind::Add | ChangeKind::FirstTime => added.push(change.record.clone()),
                ChangeKind::Modify => modified.push(change.record.clone()),
                ChangeKind::Remove => removed.push(change.record.clone()),
            }
        }

        [
            ChangeEvent::new(collection_name, ChangeKind::Add, added),
            ChangeEvent::new(collection_name, ChangeKind::Modify, modified),
            ChangeEvent::new(collection_name, ChangeKind::Remove, removed),
        ]
    }
}

/// What a change feed emits.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Snapshot(FeedSnapshot),
    /// Feed-side error. The feed may keep going afterwards.
    Error(String),
}

/// Upstream store exposing per-collection change feeds.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Opens a change feed for `collection_name`.
    ///
    /// The source should stop producing once the receiver is dropped.
    async fn open_change_feed(
        &self,
        collection_name: &str,
    ) -> SyncResult<mpsc::Receiver<FeedEvent>>;
}

// =============================================================================
// Transport
// =============================================================================

/// Transport backed by a [`ChangeFeedSource`].
pub struct DirectFeedTransport {
    source: Arc<dyn ChangeFeedSource>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DirectFeedTransport {
    pub fn new(source: Arc<dyn ChangeFeedSource>, dispatcher: Arc<Dispatcher>) -> Self {
        DirectFeedTransport {
            source,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Number of feed tasks still running.
    pub fn active_feeds(&self) -> usize {
        match self.tasks.lock() {
            Ok(tasks) => tasks.iter().filter(|t| !t.is_finished()).count(),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl Transport for DirectFeedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectFeed
    }

    async fn start(&self, config: Arc<SubscriptionConfig>) -> SyncResult<Readiness> {
        let events = self.source.open_change_feed(&config.collection_name).await?;
        let (signal, readiness) = Readiness::channel(&config.collection_name);

        info!(
            collection = %config.collection_name,
            cache = %config.cache(),
            "Opened change feed"
        );

        let handle = tokio::spawn(run_feed(self.dispatcher.clone(), config, events, signal));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }

        Ok(readiness)
    }

    async fn shutdown(&self) {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for handle in &handles {
            handle.abort();
        }
        info!(feeds = handles.len(), "Direct feed transport stopped");
    }
}

/// Consumes one change feed until it closes.
async fn run_feed(
    dispatcher: Arc<Dispatcher>,
    config: Arc<SubscriptionConfig>,
    mut events: mpsc::Receiver<FeedEvent>,
    mut ready: ReadySignal,
) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Snapshot(snapshot) => {
                handle_snapshot(&dispatcher, &config, snapshot);
                // Never rejected: a failed delivery is logged above.
                ready.resolve(Ok(()));
            }
            FeedEvent::Error(message) => {
                warn!(
                    collection = %config.collection_name,
                    error = %message,
                    "Change feed reported an error"
                );
            }
        }
    }

    if !ready.is_resolved() {
        error!(
            collection = %config.collection_name,
            "Change feed closed before its first snapshot"
        );
        ready.resolve(Err(SyncError::FeedClosed(config.collection_name.clone())));
    } else {
        info!(collection = %config.collection_name, "Change feed closed");
    }
}

fn handle_snapshot(dispatcher: &Dispatcher, config: &SubscriptionConfig, snapshot: FeedSnapshot) {
    if dispatcher.claim_first_time(config) {
        let event = ChangeEvent::first_time(config.collection_name.as_str(), snapshot.documents);
        let count = event.len();
        match dispatcher.deliver_event(config, &event) {
            Ok(_) => info!(
                collection = %config.collection_name,
                cache = %config.cache(),
                records = count,
                "Initial snapshot loaded"
            ),
            Err(e) => error!(
                collection = %config.collection_name,
                error = %e,
                "Initial snapshot delivery failed"
            ),
        }
        return;
    }

    debug!(
        collection = %config.collection_name,
        changes = snapshot.changes.len(),
        "Incremental snapshot"
    );

    let events = snapshot.partition(&config.collection_name);
    if let Err(e) = dispatcher.deliver_batch(config, events) {
        error!(
            collection = %config.collection_name,
            error = %e,
            "Incremental delivery failed"
        );
    }
}
