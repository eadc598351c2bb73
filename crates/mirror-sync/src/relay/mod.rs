//! # Relay Plumbing
//!
//! The key/value store and pub/sub bus the relay transport reads from,
//! the Redis implementations of both, and the writer that feeds them.
//!
//! ## Seams
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  RelayTransport ──► KeyValueStore  (scan_keys, bulk_get)                │
//! │        │                 ▲                                              │
//! │        │                 └── RedisKeyValue    request connection        │
//! │        │                                                                │
//! │        └──────────► MessageBus     (subscribe_pattern)                  │
//! │                          ▲                                              │
//! │                          └── RedisMessageBus  subscriber connection     │
//! │                                                                         │
//! │  RelayPublisher ──► KeyValueWriter (put, delete, publish)               │
//! │                          ▲                                              │
//! │                          └── RedisKeyValue                              │
//! │                                                                         │
//! │  Each Redis connection reconnects with bounded backoff and then         │
//! │  gives up for good (ConnectionState::GivenUp).                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod protocol;
pub mod publisher;

use async_trait::async_trait;
use mirror_core::ConnectionState;
use tokio::sync::mpsc;

use crate::error::SyncResult;

pub use client::{RedisKeyValue, RedisMessageBus, RedisSettings};
pub use protocol::{RelayMessage, StoredRecord, UpdateType, DEFAULT_CHANNEL_PREFIX};
pub use publisher::RelayPublisher;

/// Read side of the relay's key/value namespace.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Every key matching a glob `pattern`, across all cursor pages.
    async fn scan_keys(&self, pattern: &str) -> SyncResult<Vec<String>>;

    /// Values for `keys`, in order. Keys deleted since the scan yield `None`.
    async fn bulk_get(&self, keys: &[String]) -> SyncResult<Vec<Option<String>>>;

    fn connection_state(&self) -> ConnectionState;
}

/// Write side of the relay, used by [`RelayPublisher`].
#[async_trait]
pub trait KeyValueWriter: Send + Sync {
    async fn put(&self, key: &str, value: String) -> SyncResult<()>;

    async fn delete(&self, key: &str) -> SyncResult<()>;

    async fn publish(&self, channel: &str, payload: String) -> SyncResult<()>;
}

/// What a pattern subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message { channel: String, payload: String },
    /// The subscription was re-established after a drop. Messages published
    /// in between were lost.
    Resubscribed,
}

/// Pub/sub side of the relay.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribes to a channel pattern. Returns once the subscription is
    /// active. The receiver closes when the bus gives up reconnecting.
    async fn subscribe_pattern(&self, pattern: &str) -> SyncResult<mpsc::Receiver<BusEvent>>;

    fn connection_state(&self) -> ConnectionState;
}
