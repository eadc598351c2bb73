//! # Mirror Cache Node
//!
//! Long-running relay consumer. Mirrors every collection declared in the
//! configuration into an in-process cache and logs relay health until a
//! shutdown signal arrives.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Node                                     │
//! │                                                                         │
//! │  1. MirrorConfig::load(path?)     file ─► MIRROR_* env ─► validate      │
//! │  2. RedisKeyValue::connect        request connection (bounded retry)    │
//! │  3. RedisMessageBus::new          subscriber connection (lazy)          │
//! │  4. SyncEngine::subscribe         backfill every collection             │
//! │  5. health loop                   until Ctrl+C / SIGTERM                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `cache-node [CONFIG_PATH]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use mirror_core::{FirstTimeGate, KeyedStore};
use mirror_sync::{
    MirrorConfig, RedisKeyValue, RedisMessageBus, RelayTransport, SyncEngine, TransportKind,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting mirror cache node...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = MirrorConfig::load(config_path).context("loading mirror config")?;

    if config.engine.default_transport != TransportKind::Relay {
        bail!(
            "cache-node only runs the relay transport, config asks for {}",
            config.engine.default_transport
        );
    }
    if config.collections.is_empty() {
        warn!("No collections configured; the node will only report health");
    }

    info!(
        redis_url = %config.relay.redis_url,
        channel_prefix = %config.relay.channel_prefix,
        collections = config.collections.len(),
        "Configuration loaded"
    );

    let redis = config.relay.redis_settings();
    let kv = Arc::new(
        RedisKeyValue::connect(redis.clone())
            .await
            .context("connecting to Redis")?,
    );
    let bus = Arc::new(RedisMessageBus::new(redis).context("creating Redis subscriber")?);

    let builder = SyncEngine::builder(KeyedStore::new_shared(), FirstTimeGate::new_shared());
    let relay = Arc::new(RelayTransport::new(
        kv,
        bus,
        builder.dispatcher(),
        config.relay.relay_settings(),
    ));
    let engine = builder
        .transport(relay.clone())
        .default_transport(TransportKind::Relay)
        .build()?;

    engine
        .subscribe(config.subscriptions())
        .await
        .context("loading initial snapshots")?;

    for name in engine.store().cache_names() {
        info!(
            cache = %name,
            records = engine.store().records(&name).len(),
            "Cache ready"
        );
    }

    let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
    ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let health = relay.health();
                if health.is_degraded() {
                    error!(
                        request = %health.request,
                        subscriber = %health.subscriber,
                        "Relay connection gave up; cached data is going stale"
                    );
                } else {
                    info!(
                        request = %health.request,
                        subscriber = %health.subscriber,
                        delivered = health.delivered_messages,
                        ignored = health.ignored_messages,
                        malformed = health.malformed_messages,
                        "Relay health"
                    );
                }
            }
        }
    }

    engine.shutdown().await;
    info!("Cache node shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping subscriptions...");
}
