//! # Transports
//!
//! A transport turns one [`SubscriptionConfig`] into a stream of change
//! events delivered through the [`Dispatcher`](crate::dispatch::Dispatcher),
//! and reports when that subscription's initial snapshot is in the cache.
//!
//! ## Transport Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Transport::start()                               │
//! │                                                                         │
//! │  SubscriptionConfig ──► start() ──► Readiness ──► wait() ──► Ok(())     │
//! │                            │                                            │
//! │                            │ spawns work that keeps running             │
//! │                            ▼                                            │
//! │                   ┌─────────────────┐                                   │
//! │                   │   Dispatcher    │  first_time once per cache name   │
//! │                   │  default parser │  then add / modify / remove       │
//! │                   │  then listeners │                                   │
//! │                   └─────────────────┘                                   │
//! │                                                                         │
//! │  DirectFeed: readiness resolves on the first snapshot, never rejects    │
//! │              (unless the feed closes before sending one)                │
//! │  Relay:      readiness resolves after backfill + buffered drain,        │
//! │              rejects if the backfill fails                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod direct;
pub mod relay;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{SyncError, SyncResult};
use crate::subscription::SubscriptionConfig;

pub use direct::{ChangeFeedSource, DirectFeedTransport, DocumentChange, FeedEvent, FeedSnapshot};
pub use relay::{RelayHealth, RelaySettings, RelayTransport};

// =============================================================================
// Transport Kind
// =============================================================================

/// Which transport a subscription uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Native change feed of the upstream collection.
    DirectFeed,
    /// Redis key/value snapshot plus pub/sub deltas.
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::DirectFeed => write!(f, "direct_feed"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct_feed" | "direct" | "feed" => Ok(TransportKind::DirectFeed),
            "relay" | "redis" => Ok(TransportKind::Relay),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Completes once a subscription's initial snapshot is in the cache.
#[derive(Debug)]
pub struct Readiness {
    collection_name: String,
    rx: oneshot::Receiver<SyncResult<()>>,
}

/// Sending half of a [`Readiness`]. Resolves at most once.
#[derive(Debug)]
pub struct ReadySignal {
    tx: Option<oneshot::Sender<SyncResult<()>>>,
}

impl Readiness {
    /// Creates a connected signal/readiness pair.
    pub fn channel(collection_name: impl Into<String>) -> (ReadySignal, Readiness) {
        let (tx, rx) = oneshot::channel();
        (
            ReadySignal { tx: Some(tx) },
            Readiness {
                collection_name: collection_name.into(),
                rx,
            },
        )
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// Waits for the initial snapshot.
    ///
    /// A signal dropped without resolving counts as a failure.
    pub async fn wait(self) -> SyncResult<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ChannelError(format!(
                "readiness for '{}' dropped before resolving",
                self.collection_name
            ))),
        }
    }
}

impl ReadySignal {
    /// Resolves the paired [`Readiness`]. Returns `false` if it was already
    /// resolved.
    pub fn resolve(&mut self, result: SyncResult<()>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Receiver may be gone if the caller stopped waiting.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// A source of change events for subscriptions.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begins mirroring one subscription. Returns once the work is running;
    /// the returned [`Readiness`] completes when the initial snapshot landed.
    async fn start(&self, config: Arc<SubscriptionConfig>) -> SyncResult<Readiness>;

    /// Stops background work. Subscriptions are not resumable afterwards.
    async fn shutdown(&self) {}
}
