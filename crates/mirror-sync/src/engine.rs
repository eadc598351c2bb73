//! # Sync Engine
//!
//! Public entry point. Owns the dispatcher (and through it the cache and
//! the first-time gate), starts subscriptions on their transports, and
//! exposes cache reads.
//!
//! ## Subscribe Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SyncEngine::subscribe(configs)                     │
//! │                                                                         │
//! │  1. resolve defaults (cache_name, transport)                            │
//! │  2. validate: names, shape conflicts (this batch and earlier ones),     │
//! │     missing transports                                                  │
//! │  3. start every config on its transport  ──► Readiness per config       │
//! │  4. try_join_all(readiness)                                             │
//! │                                                                         │
//! │          ┌──────────┐   ┌──────────┐   ┌──────────┐                     │
//! │          │ users    │   │ orders   │   │ items    │                     │
//! │          │ relay    │   │ relay    │   │ direct   │                     │
//! │          └────┬─────┘   └────┬─────┘   └────┬─────┘                     │
//! │               └──────────────┼──────────────┘                           │
//! │                              ▼                                          │
//! │                Ok(()) once every initial snapshot is cached             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures_util::future::try_join_all;
use mirror_core::{FirstTimeGate, KeyedStore, ObjectCache, ParseAs, Record};
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{SyncError, SyncResult};
use crate::relay::{KeyValueStore, MessageBus};
use crate::subscription::SubscriptionConfig;
use crate::transport::{
    ChangeFeedSource, DirectFeedTransport, Readiness, RelaySettings, RelayTransport, Transport,
    TransportKind,
};

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`SyncEngine`] from a store, a gate and its transports.
pub struct SyncEngineBuilder {
    dispatcher: Arc<Dispatcher>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    default_transport: Option<TransportKind>,
}

impl SyncEngineBuilder {
    /// Dispatcher that custom transports must deliver through.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Adds a direct change-feed transport.
    pub fn direct_feed(self, source: Arc<dyn ChangeFeedSource>) -> Self {
        let transport = DirectFeedTransport::new(source, self.dispatcher.clone());
        self.transport(Arc::new(transport))
    }

    /// Adds a relay transport over the given store and bus.
    pub fn relay(
        self,
        kv: Arc<dyn KeyValueStore>,
        bus: Arc<dyn MessageBus>,
        settings: RelaySettings,
    ) -> Self {
        let transport = RelayTransport::new(kv, bus, self.dispatcher.clone(), settings);
        self.transport(Arc::new(transport))
    }

    /// Adds (or replaces) the transport for its kind.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Transport used by subscriptions that do not pick one.
    pub fn default_transport(mut self, kind: TransportKind) -> Self {
        self.default_transport = Some(kind);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        if self.transports.is_empty() {
            return Err(SyncError::InvalidConfig("no transport configured".into()));
        }

        let default_transport = match self.default_transport {
            Some(kind) => kind,
            None if self.transports.len() == 1 => {
                *self.transports.keys().next().unwrap_or(&TransportKind::Relay)
            }
            None => TransportKind::Relay,
        };

        if !self.transports.contains_key(&default_transport) {
            return Err(SyncError::TransportUnavailable(default_transport));
        }

        Ok(SyncEngine {
            dispatcher: self.dispatcher,
            transports: self.transports,
            default_transport,
            declared: Mutex::new(HashMap::new()),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Keeps named caches in sync with remote collections.
pub struct SyncEngine {
    dispatcher: Arc<Dispatcher>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    default_transport: TransportKind,
    /// Shape of every cache name an accepted subscription writes, including
    /// ones whose first snapshot has not landed yet.
    declared: Mutex<HashMap<String, ParseAs>>,
}

impl SyncEngine {
    pub fn builder(store: Arc<KeyedStore>, gate: Arc<FirstTimeGate>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            dispatcher: Arc::new(Dispatcher::new(store, gate)),
            transports: HashMap::new(),
            default_transport: None,
        }
    }

    pub fn default_transport(&self) -> TransportKind {
        self.default_transport
    }

    pub fn transport(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.get(&kind)
    }

    pub fn store(&self) -> &Arc<KeyedStore> {
        self.dispatcher.store()
    }

    pub fn gate(&self) -> &Arc<FirstTimeGate> {
        self.dispatcher.gate()
    }

    /// Starts every subscription and waits until all initial snapshots are
    /// cached.
    ///
    /// All configs are started before any readiness is awaited. The first
    /// readiness failure is returned; subscriptions that already started
    /// keep running.
    pub async fn subscribe(&self, configs: Vec<SubscriptionConfig>) -> SyncResult<()> {
        let configs: Vec<Arc<SubscriptionConfig>> = configs
            .into_iter()
            .map(|config| Arc::new(config.resolved()))
            .collect();

        self.validate(&configs)?;

        let mut started: Vec<Readiness> = Vec::with_capacity(configs.len());
        for config in configs {
            let kind = config.transport.unwrap_or(self.default_transport);
            let transport = self
                .transports
                .get(&kind)
                .ok_or(SyncError::TransportUnavailable(kind))?;

            info!(
                collection = %config.collection_name,
                cache = %config.cache(),
                parse_as = %config.parse_as,
                transport = %kind,
                "Starting subscription"
            );
            started.push(transport.start(config).await?);
        }

        let count = started.len();
        try_join_all(started.into_iter().map(Readiness::wait)).await?;

        info!(subscriptions = count, "All initial snapshots loaded");
        Ok(())
    }

    /// Rejects bad names, unknown transports and cache names declared with
    /// two shapes. Shapes are checked against this batch, every earlier
    /// accepted batch, then the store. Accepted shapes are recorded.
    fn validate(&self, configs: &[Arc<SubscriptionConfig>]) -> SyncResult<()> {
        let mut declared = self.declared.lock().unwrap_or_else(|e| e.into_inner());
        let mut shapes: HashMap<&str, ParseAs> = HashMap::new();
        let mut owners: HashMap<&str, HashSet<&str>> = HashMap::new();

        for config in configs {
            if config.collection_name.trim().is_empty() {
                return Err(SyncError::InvalidConfig("collection name is empty".into()));
            }
            if config.cache().trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "cache name for '{}' is empty",
                    config.collection_name
                )));
            }
            if config.key_field.is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "key field for '{}' is empty",
                    config.collection_name
                )));
            }

            let kind = config.transport.unwrap_or(self.default_transport);
            if !self.transports.contains_key(&kind) {
                return Err(SyncError::TransportUnavailable(kind));
            }

            let cache = config.cache();
            let existing = shapes
                .get(cache)
                .or_else(|| declared.get(cache))
                .copied()
                .or_else(|| self.store().shape(cache));
            if let Some(shape) = existing {
                if shape != config.parse_as {
                    return Err(SyncError::InvalidConfig(format!(
                        "cache '{}' is declared as both {} and {}",
                        cache, shape, config.parse_as
                    )));
                }
            }
            shapes.insert(cache, config.parse_as);
            owners
                .entry(cache)
                .or_default()
                .insert(config.collection_name.as_str());
        }

        for (cache, collections) in owners.iter().filter(|(_, c)| c.len() > 1) {
            let mut collections: Vec<_> = collections.iter().copied().collect();
            collections.sort_unstable();
            warn!(
                cache = %cache,
                collections = ?collections,
                "Several collections share one cache name; only the first bootstrap is first_time"
            );
        }

        for (cache, shape) in shapes {
            declared.insert(cache.to_string(), shape);
        }
        Ok(())
    }

    // =========================================================================
    // Cache Reads
    // =========================================================================

    /// Array-shaped cache contents, or empty.
    pub fn get_array(&self, name: &str) -> Vec<Record> {
        self.store().get_array(name)
    }

    /// Map-shaped cache contents, or `default`.
    pub fn get_object(&self, name: &str, default: ObjectCache) -> ObjectCache {
        self.store().get_object(name, default)
    }

    /// Stops every transport's background work.
    pub async fn shutdown(&self) {
        for (kind, transport) in &self.transports {
            transport.shutdown().await;
            info!(transport = %kind, "Transport shut down");
        }
    }
}
