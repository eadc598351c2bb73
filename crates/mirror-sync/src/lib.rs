//! # mirror-sync: Transports and Sync Engine
//!
//! Keeps named in-memory caches synchronized with remote collections,
//! either through a collection's native change feed or through a Redis
//! relay (key/value snapshot plus pub/sub deltas).
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Mirror Sync                                    │
//! │                                                                         │
//! │   caller ──► SyncEngine::subscribe([SubscriptionConfig, ...])           │
//! │                   │                                                     │
//! │        ┌──────────┴───────────┐                                         │
//! │        ▼                      ▼                                         │
//! │  DirectFeedTransport     RelayTransport ◄── RedisKeyValue (SCAN, MGET)  │
//! │  (ChangeFeedSource)            ▲                                        │
//! │        │                       └──────── RedisMessageBus (PSUBSCRIBE)   │
//! │        └──────────┬───────────┘                                         │
//! │                   ▼                                                     │
//! │              Dispatcher                                                 │
//! │     FirstTimeGate ─ default parser ─ callbacks ─ listeners              │
//! │                   │                                                     │
//! │                   ▼                                                     │
//! │              KeyedStore  ◄── get_array / get_object                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - `SyncEngine` and its builder
//! - [`subscription`] - Per-collection configuration and listeners
//! - [`dispatch`] - Default mutation then listener delivery
//! - [`transport`] - Direct feed and relay transports
//! - [`relay`] - Relay wire protocol, Redis connections, publisher
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod relay;
pub mod subscription;
pub mod transport;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use config::{CollectionEntry, MirrorConfig};
pub use dispatch::{Dispatcher, Reconcile, SnapshotDelivery};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use relay::{
    BusEvent, KeyValueStore, KeyValueWriter, MessageBus, RedisKeyValue, RedisMessageBus,
    RedisSettings, RelayMessage, RelayPublisher, UpdateType,
};
pub use subscription::{ChangeListener, ListenerError, ListenerResult, SubscriptionConfig};
pub use transport::{
    ChangeFeedSource, DirectFeedTransport, DocumentChange, FeedEvent, FeedSnapshot, Readiness,
    ReadySignal, RelayHealth, RelaySettings, RelayTransport, Transport, TransportKind,
};
