//! # Redis Connections
//!
//! The relay uses two independent Redis connections:
//!
//! - **request** ([`RedisKeyValue`]): SCAN, MGET and the publisher's writes
//! - **subscriber** ([`RedisMessageBus`]): a single PSUBSCRIBE stream
//!
//! Each one reconnects with exponential backoff and gives up after
//! `max_attempts` consecutive failures. A connection that gave up stays
//! down until the process restarts; its state is observable through
//! [`RedisKeyValue::subscribe_state`] and [`RedisMessageBus::subscribe_state`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use mirror_core::{ConnectionState, ReconnectPolicy, ReconnectTracker};
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{RedisError, RedisResult};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::relay::{BusEvent, KeyValueStore, KeyValueWriter, MessageBus};

/// Buffered pub/sub messages between the subscriber task and its reader.
const BUS_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Settings
// =============================================================================

/// Connection settings shared by both Redis connections.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Redis URL (`redis://` or `rediss://`).
    pub url: String,

    /// COUNT hint for each SCAN page.
    pub scan_count: usize,

    /// Keys per MGET round trip.
    pub fetch_batch_size: usize,

    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,

    /// Backoff and attempt ceiling.
    pub reconnect: ReconnectPolicy,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            url: "redis://127.0.0.1:6379".to_string(),
            scan_count: 500,
            fetch_batch_size: 500,
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// =============================================================================
// Connect Loop
// =============================================================================

/// Runs `connect` until it succeeds or the policy gives up.
async fn connect_with_backoff<T, F, Fut>(
    connection: &'static str,
    state: &watch::Sender<ConnectionState>,
    settings: &RedisSettings,
    mut connect: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RedisResult<T>>,
{
    let policy = settings.reconnect;
    let given_up = *state.borrow() == ConnectionState::GivenUp;
    if given_up {
        return Err(SyncError::ReconnectExhausted {
            connection: connection.to_string(),
            attempts: policy.max_attempts,
        });
    }

    let mut tracker = ReconnectTracker::new(policy);

    loop {
        state.send_replace(ConnectionState::Connecting);

        let failure = match timeout(settings.connect_timeout, connect()).await {
            Ok(Ok(conn)) => {
                tracker.connected();
                state.send_replace(ConnectionState::Connected);
                info!(connection, "Redis connection established");
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {:?}", settings.connect_timeout),
        };

        match tracker.failed() {
            Some(delay) => {
                state.send_replace(ConnectionState::BackingOff);
                warn!(
                    connection,
                    attempt = tracker.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Redis connection failed, backing off"
                );
                tokio::time::sleep(delay).await;
                tracker.retrying();
            }
            None => {
                state.send_replace(ConnectionState::GivenUp);
                error!(
                    connection,
                    attempts = policy.max_attempts,
                    error = %failure,
                    "Max reconnection attempts reached, giving up"
                );
                return Err(SyncError::ReconnectExhausted {
                    connection: connection.to_string(),
                    attempts: policy.max_attempts,
                });
            }
        }
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error()
}

// =============================================================================
// Request Connection
// =============================================================================

/// Key/value access over a multiplexed request connection.
pub struct RedisKeyValue {
    client: redis::Client,
    settings: RedisSettings,
    conn: Mutex<Option<MultiplexedConnection>>,
    state: watch::Sender<ConnectionState>,
}

impl RedisKeyValue {
    /// Opens the request connection, retrying per the reconnect policy.
    pub async fn connect(settings: RedisSettings) -> SyncResult<Self> {
        let client = redis::Client::open(settings.url.as_str())?;
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let kv = RedisKeyValue {
            client,
            settings,
            conn: Mutex::new(None),
            state,
        };
        kv.connection().await?;
        Ok(kv)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connection(&self) -> SyncResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let client = &self.client;
        let conn = connect_with_backoff("request", &self.state, &self.settings, move || {
            client.get_multiplexed_async_connection()
        })
        .await?;

        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Runs `op`, reconnecting once if the connection turned out to be dead.
    async fn with_connection<T, F, Fut>(&self, op: F) -> SyncResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_error(&e) => {
                warn!(error = %e, "Request connection lost, reconnecting");
                self.conn.lock().await.take();
                let conn = self.connection().await?;
                Ok(op(conn).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValue {
    async fn scan_keys(&self, pattern: &str) -> SyncResult<Vec<String>> {
        let count = self.settings.scan_count.max(1);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        let mut pages = 0usize;

        loop {
            let (next, page) = self
                .with_connection(|mut conn| async move {
                    let page: (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn)
                        .await?;
                    Ok::<_, RedisError>(page)
                })
                .await?;

            keys.extend(page);
            pages += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();

        debug!(pattern, pages, keys = keys.len(), "Scan complete");
        Ok(keys)
    }

    async fn bulk_get(&self, keys: &[String]) -> SyncResult<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(self.settings.fetch_batch_size.max(1)) {
            let batch: Vec<String> = chunk.to_vec();
            let fetched = self
                .with_connection(|mut conn| {
                    let batch = &batch;
                    async move {
                        let fetched: Vec<Option<String>> =
                            redis::cmd("MGET").arg(batch).query_async(&mut conn).await?;
                        Ok::<_, RedisError>(fetched)
                    }
                })
                .await?;
            values.extend(fetched);
        }

        Ok(values)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl KeyValueWriter for RedisKeyValue {
    async fn put(&self, key: &str, value: String) -> SyncResult<()> {
        let value = value.as_str();
        self.with_connection(|mut conn| async move {
            let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.with_connection(|mut conn| async move {
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: String) -> SyncResult<()> {
        let payload = payload.as_str();
        let receivers = self
            .with_connection(|mut conn| async move {
                let receivers: i64 = redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, RedisError>(receivers)
            })
            .await?;

        debug!(channel, receivers, "Published relay message");
        Ok(())
    }
}

// =============================================================================
// Subscriber Connection
// =============================================================================

/// Pattern subscriptions over a dedicated pub/sub connection.
pub struct RedisMessageBus {
    client: redis::Client,
    settings: RedisSettings,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl RedisMessageBus {
    pub fn new(settings: RedisSettings) -> SyncResult<Self> {
        let client = redis::Client::open(settings.url.as_str())?;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Ok(RedisMessageBus {
            client,
            settings,
            state: Arc::new(state),
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn subscribe_pattern(&self, pattern: &str) -> SyncResult<mpsc::Receiver<BusEvent>> {
        let pubsub = open_pubsub(&self.client, pattern, &self.state, &self.settings).await?;
        info!(pattern, "Pattern subscription active");

        let (tx, rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        tokio::spawn(run_subscriber(
            self.client.clone(),
            pattern.to_string(),
            pubsub,
            self.state.clone(),
            self.settings.clone(),
            tx,
        ));
        Ok(rx)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

async fn open_pubsub(
    client: &redis::Client,
    pattern: &str,
    state: &watch::Sender<ConnectionState>,
    settings: &RedisSettings,
) -> SyncResult<PubSub> {
    connect_with_backoff("subscriber", state, settings, move || async move {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        Ok::<_, RedisError>(pubsub)
    })
    .await
}

/// Forwards messages until the reader goes away or reconnecting gives up.
/// Returning drops `tx`, which closes the reader's channel.
async fn run_subscriber(
    client: redis::Client,
    pattern: String,
    mut pubsub: PubSub,
    state: Arc<watch::Sender<ConnectionState>>,
    settings: RedisSettings,
    tx: mpsc::Sender<BusEvent>,
) {
    loop {
        let mut messages = Box::pin(pubsub.into_on_message());

        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                    continue;
                }
            };

            if tx.send(BusEvent::Message { channel, payload }).await.is_err() {
                debug!(pattern = %pattern, "Bus reader dropped, stopping subscriber");
                return;
            }
        }
        drop(messages);

        if tx.is_closed() {
            return;
        }

        warn!(pattern = %pattern, "Subscriber connection lost");
        pubsub = match open_pubsub(&client, &pattern, &state, &settings).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                error!(
                    pattern = %pattern,
                    error = %e,
                    "Subscriber gave up; relay updates have stopped"
                );
                return;
            }
        };

        info!(pattern = %pattern, "Pattern subscription restored");
        if tx.send(BusEvent::Resubscribed).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RedisSettings::default();
        assert_eq!(settings.scan_count, 500);
        assert_eq!(settings.fetch_batch_size, 500);
        assert_eq!(settings.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let settings = RedisSettings {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(RedisMessageBus::new(settings).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_loop_gives_up_after_ceiling() {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let settings = RedisSettings::default();
        let mut calls = 0u32;

        let result: SyncResult<()> = connect_with_backoff("request", &state, &settings, || {
            calls += 1;
            async {
                Err(RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(SyncError::ReconnectExhausted { attempts: 5, .. })
        ));
        assert_eq!(calls, 6);
        assert_eq!(*state.borrow(), ConnectionState::GivenUp);

        // Terminal: no further attempts are made.
        let again: SyncResult<()> =
            connect_with_backoff("request", &state, &settings, || async { Ok(()) }).await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_loop_recovers() {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let settings = RedisSettings::default();
        let mut calls = 0u32;

        let result = connect_with_backoff("subscriber", &state, &settings, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(RedisError::from(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(*state.borrow(), ConnectionState::Connected);
    }
}
