//! # Relay Transport
//!
//! Mirrors collections through Redis: a key/value namespace holds the
//! current records and a pub/sub channel announces each change.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Relay Transport                                │
//! │                                                                         │
//! │  start(config) ──► Register ─┐                                          │
//! │                              ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     Router task (one)                           │   │
//! │  │                                                                 │   │
//! │  │  routes: [ config ─ pending buffer ─ readiness ]                │   │
//! │  │                                                                 │   │
//! │  │  Register    ──► spawn backfill (SCAN + MGET), buffer messages  │   │
//! │  │  Backfilled  ──► first_time / diff, drain buffer, resolve ready │   │
//! │  │  Message     ──► buffered while backfilling, else dispatched    │   │
//! │  │  Resubscribed──► re-backfill live routes, queue a rescan for    │   │
//! │  │                  routes whose backfill is still in flight       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │        ▲                                   ▲                            │
//! │        │ backfill results                  │ BusEvent                   │
//! │  KeyValueStore (request conn)        MessageBus (subscriber conn)       │
//! │                                      PSUBSCRIBE "{prefix}*"             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pattern subscription is active before the first backfill starts, so
//! no change published during a backfill is missed. Messages for a route
//! are applied in arrival order after its snapshot. A reconnect that lands
//! while a backfill is in flight schedules one more backfill for that
//! route, since the running SCAN may predate the outage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mirror_core::{ChangeEvent, ConnectionState, Record};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, Reconcile, SnapshotDelivery};
use crate::error::{SyncError, SyncResult};
use crate::relay::protocol::{
    channel_pattern, decode_stored, key_pattern, RelayMessage, DEFAULT_CHANNEL_PREFIX,
};
use crate::relay::{BusEvent, KeyValueStore, MessageBus};
use crate::subscription::SubscriptionConfig;
use crate::transport::{Readiness, ReadySignal, Transport, TransportKind};

// =============================================================================
// Settings & Health
// =============================================================================

/// Relay transport settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Channel prefix; the transport subscribes to `"{prefix}*"`.
    pub channel_prefix: String,

    /// Re-scan every live subscription after the subscriber reconnects.
    pub rebackfill_on_reconnect: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            rebackfill_on_reconnect: true,
        }
    }
}

/// Point-in-time view of the relay's connections and message counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHealth {
    pub request: ConnectionState,
    pub subscriber: ConnectionState,
    /// Messages applied to the cache.
    pub delivered_messages: u64,
    /// Messages for collections without a subscription.
    pub ignored_messages: u64,
    /// Messages that failed to decode.
    pub malformed_messages: u64,
}

impl RelayHealth {
    /// True once either connection has stopped reconnecting.
    pub fn is_degraded(&self) -> bool {
        self.request == ConnectionState::GivenUp || self.subscriber == ConnectionState::GivenUp
    }
}

#[derive(Debug, Default)]
struct RelayStats {
    delivered: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
}

// =============================================================================
// Backfill
// =============================================================================

/// Reads every stored record of a collection.
///
/// Keys that vanish between SCAN and MGET are skipped. Any decode failure
/// fails the whole backfill.
pub async fn backfill(kv: &dyn KeyValueStore, collection: &str) -> SyncResult<Vec<Record>> {
    let keys = kv.scan_keys(&key_pattern(collection)).await?;
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let values = kv.bulk_get(&keys).await?;
    keys.iter()
        .zip(values)
        .filter_map(|(key, raw)| raw.map(|raw| decode_stored(key, &raw)))
        .collect()
}

// =============================================================================
// Transport
// =============================================================================

/// Transport backed by a [`KeyValueStore`] and a [`MessageBus`].
pub struct RelayTransport {
    kv: Arc<dyn KeyValueStore>,
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<Dispatcher>,
    settings: RelaySettings,
    stats: Arc<RelayStats>,
    router: OnceCell<mpsc::UnboundedSender<RouterCommand>>,
}

impl RelayTransport {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        bus: Arc<dyn MessageBus>,
        dispatcher: Arc<Dispatcher>,
        settings: RelaySettings,
    ) -> Self {
        RelayTransport {
            kv,
            bus,
            dispatcher,
            settings,
            stats: Arc::new(RelayStats::default()),
            router: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn health(&self) -> RelayHealth {
        RelayHealth {
            request: self.kv.connection_state(),
            subscriber: self.bus.connection_state(),
            delivered_messages: self.stats.delivered.load(Ordering::Relaxed),
            ignored_messages: self.stats.ignored.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed.load(Ordering::Relaxed),
        }
    }

    /// Subscribes to the channel pattern and starts the router, once.
    async fn router(&self) -> SyncResult<&mpsc::UnboundedSender<RouterCommand>> {
        self.router
            .get_or_try_init(|| async {
                let pattern = channel_pattern(&self.settings.channel_prefix);
                let bus_events = self.bus.subscribe_pattern(&pattern).await?;

                let (tx, rx) = mpsc::unbounded_channel();
                let router = Router {
                    dispatcher: self.dispatcher.clone(),
                    kv: self.kv.clone(),
                    settings: self.settings.clone(),
                    stats: self.stats.clone(),
                    commands: tx.clone(),
                    routes: Vec::new(),
                    next_id: 0,
                };
                tokio::spawn(router.run(rx, bus_events));

                info!(pattern = %pattern, "Relay router started");
                Ok(tx)
            })
            .await
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn start(&self, config: Arc<SubscriptionConfig>) -> SyncResult<Readiness> {
        let router = self.router().await?;
        let (signal, readiness) = Readiness::channel(&config.collection_name);

        router
            .send(RouterCommand::Register {
                config,
                ready: signal,
            })
            .map_err(|_| SyncError::ChannelError("relay router stopped".into()))?;

        Ok(readiness)
    }

    async fn shutdown(&self) {
        if let Some(router) = self.router.get() {
            // Router may already be gone.
            let _ = router.send(RouterCommand::Shutdown);
        }
    }
}

// =============================================================================
// Router
// =============================================================================

enum RouterCommand {
    Register {
        config: Arc<SubscriptionConfig>,
        ready: ReadySignal,
    },
    Backfilled {
        route: u64,
        result: SyncResult<Vec<Record>>,
    },
    Shutdown,
}

struct Route {
    id: u64,
    config: Arc<SubscriptionConfig>,
    /// Messages held back while a backfill is in flight.
    pending: Option<Vec<RelayMessage>>,
    /// Present until the initial backfill completes.
    ready: Option<ReadySignal>,
    /// The in-flight backfill follows a subscriber reconnect.
    resync: bool,
    /// A reconnect arrived during the in-flight backfill; scan again once
    /// it lands.
    rescan: bool,
}

/// Owns all routing state. Every backfill completion and every inbound
/// message passes through this one task.
struct Router {
    dispatcher: Arc<Dispatcher>,
    kv: Arc<dyn KeyValueStore>,
    settings: RelaySettings,
    stats: Arc<RelayStats>,
    commands: mpsc::UnboundedSender<RouterCommand>,
    routes: Vec<Route>,
    next_id: u64,
}

impl Router {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
        mut bus: mpsc::Receiver<BusEvent>,
    ) {
        let mut bus_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RouterCommand::Shutdown) | None => break,
                    Some(RouterCommand::Register { config, ready }) => {
                        self.register(config, ready)
                    }
                    Some(RouterCommand::Backfilled { route, result }) => {
                        self.on_backfilled(route, result)
                    }
                },
                event = bus.recv(), if bus_open => match event {
                    Some(BusEvent::Message { channel, payload }) => {
                        self.on_message(&channel, &payload)
                    }
                    Some(BusEvent::Resubscribed) => self.on_resubscribed(),
                    None => {
                        bus_open = false;
                        error!("Relay subscriber closed; the cache no longer receives updates");
                    }
                },
            }
        }

        info!(routes = self.routes.len(), "Relay router stopped");
    }

    fn register(&mut self, config: Arc<SubscriptionConfig>, ready: ReadySignal) {
        let id = self.next_id;
        self.next_id += 1;

        info!(
            collection = %config.collection_name,
            cache = %config.cache(),
            "Backfilling relay subscription"
        );

        let collection = config.collection_name.clone();
        self.routes.push(Route {
            id,
            config,
            pending: Some(Vec::new()),
            ready: Some(ready),
            resync: false,
            rescan: false,
        });
        self.spawn_backfill(id, collection);
    }

    fn spawn_backfill(&self, route: u64, collection: String) {
        let kv = self.kv.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let result = backfill(kv.as_ref(), &collection).await;
            // Router gone means shutdown.
            let _ = commands.send(RouterCommand::Backfilled { route, result });
        });
    }

    fn on_backfilled(&mut self, route: u64, result: SyncResult<Vec<Record>>) {
        let Some(index) = self.routes.iter().position(|r| r.id == route) else {
            return;
        };
        let config = self.routes[index].config.clone();

        let records = match result {
            Ok(records) => records,
            Err(e) => {
                if let Some(mut ready) = self.routes[index].ready.take() {
                    error!(
                        collection = %config.collection_name,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Initial backfill failed"
                    );
                    ready.resolve(Err(e));
                    self.routes.remove(index);
                } else {
                    error!(
                        collection = %config.collection_name,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Re-backfill failed, resuming live updates"
                    );
                    self.drain(index);
                    self.rescan_if_requested(index);
                }
                return;
            }
        };

        let reconcile = if self.routes[index].resync && self.sole_owner(index) {
            Reconcile::Full
        } else {
            Reconcile::Upsert
        };

        let count = records.len();
        let outcome = self.dispatcher.deliver_snapshot(&config, records, reconcile);
        let drained = self.drain(index);

        let ready = self.routes[index].ready.take();
        match outcome {
            Ok(delivery) => {
                match delivery {
                    SnapshotDelivery::FirstTime => info!(
                        collection = %config.collection_name,
                        cache = %config.cache(),
                        records = count,
                        drained,
                        "Initial snapshot loaded"
                    ),
                    SnapshotDelivery::Incremental { changed } => info!(
                        collection = %config.collection_name,
                        cache = %config.cache(),
                        records = count,
                        changed,
                        drained,
                        "Snapshot reconciled"
                    ),
                }
                if let Some(mut ready) = ready {
                    ready.resolve(Ok(()));
                }
            }
            Err(e) => {
                error!(
                    collection = %config.collection_name,
                    error = %e,
                    "Snapshot delivery failed"
                );
                if let Some(mut ready) = ready {
                    ready.resolve(Err(e));
                }
            }
        }

        self.rescan_if_requested(index);
    }

    /// Starts the backfill a reconnect queued while the route was busy.
    fn rescan_if_requested(&mut self, index: usize) {
        let route = &mut self.routes[index];
        if !std::mem::take(&mut route.rescan) {
            return;
        }

        route.pending = Some(Vec::new());
        route.resync = true;
        let (id, collection) = (route.id, route.config.collection_name.clone());

        info!(collection = %collection, "Re-backfilling after reconnect during backfill");
        self.spawn_backfill(id, collection);
    }

    /// Applies messages buffered during a backfill. Returns how many.
    fn drain(&mut self, index: usize) -> usize {
        let route = &mut self.routes[index];
        route.resync = false;
        let Some(buffered) = route.pending.take() else {
            return 0;
        };

        let config = route.config.clone();
        let count = buffered.len();
        for message in buffered {
            self.apply(&config, message);
        }
        count
    }

    /// True if no other route writes the same cache name.
    fn sole_owner(&self, index: usize) -> bool {
        let cache = self.routes[index].config.cache();
        self.routes
            .iter()
            .enumerate()
            .all(|(i, r)| i == index || r.config.cache() != cache)
    }

    fn on_message(&mut self, channel: &str, payload: &str) {
        let message = match RelayMessage::from_json(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(channel, error = %e, "Skipping malformed relay message");
                return;
            }
        };

        let targets: Vec<usize> = self
            .routes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.config.collection_name == message.collection_name)
            .map(|(i, _)| i)
            .collect();

        if targets.is_empty() {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(
                channel,
                collection = %message.collection_name,
                "No subscription for relay message"
            );
            return;
        }

        for index in targets {
            match self.routes[index].pending.as_mut() {
                Some(pending) => pending.push(message.clone()),
                None => {
                    let config = self.routes[index].config.clone();
                    self.apply(&config, message.clone());
                }
            }
        }
    }

    fn apply(&self, config: &SubscriptionConfig, message: RelayMessage) {
        let event = match message.into_change() {
            Ok((kind, record)) => {
                ChangeEvent::single(config.collection_name.as_str(), kind, record)
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    collection = %config.collection_name,
                    error = %e,
                    "Skipping undecodable relay record"
                );
                return;
            }
        };

        match self.dispatcher.deliver_event(config, &event) {
            Ok(_) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!(
                collection = %config.collection_name,
                kind = %event.kind,
                error = %e,
                "Relay delivery failed"
            ),
        }
    }

    fn on_resubscribed(&mut self) {
        if !self.settings.rebackfill_on_reconnect {
            warn!("Subscriber reconnected; changes published while disconnected were missed");
            return;
        }

        let mut restarted = Vec::new();
        let mut deferred = 0;
        for route in self.routes.iter_mut() {
            if route.pending.is_some() {
                route.rescan = true;
                deferred += 1;
                continue;
            }
            route.pending = Some(Vec::new());
            route.resync = true;
            restarted.push((route.id, route.config.collection_name.clone()));
        }

        info!(
            routes = restarted.len(),
            deferred,
            "Subscriber reconnected, re-backfilling"
        );
        for (id, collection) in restarted {
            self.spawn_backfill(id, collection);
        }
    }
}
